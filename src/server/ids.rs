//! Tunnel id generation and validation.

use rand::seq::SliceRandom;
use rand::Rng;

const ADJECTIVES: &[&str] = &[
    "able", "amber", "ancient", "azure", "bold", "brave", "bright", "brisk", "calm", "clever", "cool", "cosmic",
    "crisp", "curly", "dapper", "eager", "early", "fancy", "fast", "fluffy", "gentle", "giant", "glad", "golden",
    "grumpy", "happy", "honest", "humble", "icy", "jolly", "kind", "lazy", "lively", "lucky", "mellow", "merry",
    "mighty", "modern", "neat", "nice", "odd", "plain", "polite", "proud", "quick", "quiet", "rapid", "rare",
    "red", "shiny", "shy", "silent", "silly", "sleepy", "slow", "smart", "soft", "solid", "spicy", "stale",
    "steady", "sunny", "swift", "tall", "tame", "tidy", "tiny", "tough", "vast", "warm", "wild", "wise", "witty",
    "young", "zesty",
];

const NOUNS: &[&str] = &[
    "badger", "bat", "bear", "bee", "bird", "bison", "cat", "cobra", "crab", "crow", "deer", "dodo", "dog",
    "dolphin", "donkey", "dragon", "duck", "eagle", "eel", "elk", "falcon", "ferret", "fish", "fox", "frog",
    "gecko", "goat", "goose", "gull", "hare", "hawk", "heron", "horse", "husky", "ibis", "jaguar", "koala",
    "lamb", "lemur", "lion", "lizard", "llama", "lynx", "mole", "moose", "mouse", "newt", "otter", "owl", "panda",
    "parrot", "pig", "pony", "puma", "quail", "rabbit", "ram", "rat", "raven", "seal", "shark", "sheep", "sloth",
    "snail", "snake", "swan", "tiger", "toad", "trout", "turtle", "wasp", "whale", "wolf", "yak", "zebra",
];

/// Generate a human readable id such as `brave-otter-42`.
pub fn random_id() -> String {
    let mut rng = rand::thread_rng();
    let adjective = ADJECTIVES.choose(&mut rng).copied().unwrap_or("quick");
    let noun = NOUNS.choose(&mut rng).copied().unwrap_or("fox");
    let number: u8 = rng.gen_range(0..100);
    format!("{adjective}-{noun}-{number}")
}

/// Whether `id` may be claimed as a subdomain.
///
/// Lowercase alphanumerics and hyphens, 4 to 63 characters, starting and
/// ending with an alphanumeric.
pub fn is_valid_subdomain(id: &str) -> bool {
    let bytes = id.as_bytes();
    if !(4..=63).contains(&bytes.len()) {
        return false;
    }
    let alnum = |b: &u8| b.is_ascii_lowercase() || b.is_ascii_digit();
    let (first, last) = (&bytes[0], &bytes[bytes.len() - 1]);
    alnum(first) && alnum(last) && bytes.iter().all(|b| alnum(b) || *b == b'-')
}
