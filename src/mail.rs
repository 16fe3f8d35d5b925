//! Send emails to user for important updates.

use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use lapin::options::{BasicPublishOptions, QueueDeclareOptions};
use lapin::types::FieldTable;
use lapin::uri::{
    AMQPAuthority, AMQPQueryString, AMQPScheme, AMQPUri, AMQPUserInfo,
};
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties};
use rand::distributions::{Alphanumeric, DistString};
use rand::rngs::OsRng;
use serde::Serialize;
use url::Url;

use crate::config::Mail;
use crate::error::{Error, Result};
use crate::user::User;

const DEFAULT_AMPQ_HOST: &str = "localhost";
const DEFAULT_AMPQ_PORT: u16 = 5672;
const DEFAULT_AMPQ_VHOST: &str = "/";

const CONTENT_ENCODING: &str = "utf8";
const CONTENT_TYPE: &str = "application/cloudevents+json";
const DATA_CONTENT_TYPE: &str = "application/json";
const CLOUDEVENT_VERSION: &str = "1.0";
const ID_LENGTH: usize = 12;

/// Port for sending emails.
#[async_trait]
pub trait Notifier: Send + Sync {
    /// Ask the user to prove control of its email address.
    async fn send_verification_email(&self, user: &User) -> Result<()>;
}

/// Mail templates list.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Template {
    /// Link to confirm email ownership.
    EmailVerification,
}

#[derive(Debug, Serialize)]
struct Cloudevent<'a> {
    specversion: &'static str,
    r#type: &'static str,
    source: &'static str,
    id: String,
    time: String,
    datacontenttype: &'static str,
    data: Content<'a>,
}

#[derive(Debug, Serialize)]
struct Content<'a> {
    to: &'a str,
    template: Template,
    nickname: &'a str,
    verification_url: Option<String>,
}

/// Build the link a user follows to verify its email.
pub fn verification_url(base_url: &str, user: &User) -> Option<String> {
    let token = user.verification_token.as_deref()?;
    Some(format!(
        "{}/verify-email/{}/{}",
        base_url.trim_end_matches('/'),
        user.id,
        token
    ))
}

/// Mail queue manager.
///
/// Without a connection, events are dropped and only traced.
#[derive(Debug, Clone, Default)]
pub struct MailManager {
    queue: String,
    base_url: String,
    conn: Option<Arc<Connection>>,
}

impl MailManager {
    /// Create a new [`MailManager`].
    pub async fn new(config: &Mail, base_url: &str) -> Result<Self> {
        let addr = Url::parse(&config.address)?;
        let uri = AMQPUri {
            scheme: AMQPScheme::from_str(addr.scheme())
                .map_err(|_| Error::InvalidScheme)?,
            authority: AMQPAuthority {
                userinfo: AMQPUserInfo {
                    username: config.username.clone(),
                    password: config.password.clone(),
                },
                host: addr.host_str().unwrap_or(DEFAULT_AMPQ_HOST).into(),
                port: addr.port().unwrap_or(DEFAULT_AMPQ_PORT),
            },
            vhost: config
                .vhost
                .clone()
                .unwrap_or(DEFAULT_AMPQ_VHOST.to_string()),
            query: AMQPQueryString {
                channel_max: config.pool,
                ..Default::default()
            },
        };

        let conn_config = ConnectionProperties::default()
            .with_connection_name("account_service_mail_client".into());
        let conn = Connection::connect_uri(uri, conn_config).await?;

        tracing::info!(%addr, queue = config.queue, "rabbitmq connected");

        Ok(Self {
            queue: config.queue.clone(),
            base_url: base_url.to_string(),
            conn: Some(Arc::new(conn)),
        })
    }

    /// A manager that only traces events.
    pub fn disconnected(base_url: &str) -> Self {
        Self {
            base_url: base_url.to_string(),
            ..Default::default()
        }
    }

    async fn create_channel(
        conn: Arc<Connection>,
        queue: &str,
    ) -> Result<Channel> {
        let channel = conn.create_channel().await?;
        channel
            .queue_declare(
                queue,
                QueueDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await?;
        Ok(channel)
    }

    fn create_event(data: Content<'_>) -> Cloudevent<'_> {
        let id = Alphanumeric.sample_string(&mut OsRng, ID_LENGTH);
        Cloudevent {
            specversion: CLOUDEVENT_VERSION,
            r#type: "com.accounts.email",
            source: "com.accounts.account-service",
            id,
            time: Utc::now().to_rfc3339(),
            datacontenttype: DATA_CONTENT_TYPE,
            data,
        }
    }

    async fn publish(&self, content: Content<'_>) -> Result<()> {
        let Some(conn) = &self.conn else {
            tracing::debug!(template = ?content.template, "no mail queue, event dropped");
            return Ok(());
        };
        let channel =
            Self::create_channel(Arc::clone(conn), &self.queue).await?;

        let template = content.template;
        let payload = serde_json::to_vec(&Self::create_event(content))?;

        channel
            .basic_publish(
                "",
                &self.queue,
                BasicPublishOptions::default(),
                &payload,
                BasicProperties::default()
                    .with_content_encoding(CONTENT_ENCODING.into())
                    .with_content_type(CONTENT_TYPE.into()),
            )
            .await?;

        tracing::trace!(?template, "event sent");

        Ok(())
    }
}

#[async_trait]
impl Notifier for MailManager {
    async fn send_verification_email(&self, user: &User) -> Result<()> {
        let content = Content {
            to: &user.email,
            template: Template::EmailVerification,
            nickname: &user.nickname,
            verification_url: verification_url(&self.base_url, user),
        };

        self.publish(content).await
    }
}
