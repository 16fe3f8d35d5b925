//! Human-readable handle generation.

use rand::Rng;
use rand::seq::SliceRandom;

const ADJECTIVES: &[&str] = &[
    "clever", "jolly", "brave", "sly", "gentle", "swift", "quiet", "bold",
    "lucky", "witty", "calm", "eager", "fierce", "merry", "proud", "sunny",
];
const ANIMALS: &[&str] = &[
    "panda", "fox", "raccoon", "koala", "lion", "otter", "falcon", "badger",
    "heron", "lynx", "beaver", "gecko", "walrus", "puffin", "bison", "yak",
];

/// Candidate handle producer.
///
/// Candidates carry no uniqueness guarantee, callers must check them.
pub trait NicknameGenerator: Send + Sync {
    fn generate(&self) -> String;
}

/// `adjective_animal_number` generator.
#[derive(Debug, Default, Clone, Copy)]
pub struct RandomNickname;

impl NicknameGenerator for RandomNickname {
    fn generate(&self) -> String {
        let mut rng = rand::thread_rng();
        let adjective = ADJECTIVES.choose(&mut rng).unwrap_or(&"quiet");
        let animal = ANIMALS.choose(&mut rng).unwrap_or(&"otter");
        let number: u16 = rng.gen_range(0..1000);

        format!("{adjective}_{animal}_{number}")
    }
}
