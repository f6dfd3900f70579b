use rand::distributions::Alphanumeric;
use rand::Rng;
use uuid::Uuid;

pub fn uuid_v7() -> Uuid {
    Uuid::now_v7()
}

pub fn random_string(prefix: &str, length: usize) -> String {
    let suffix: String = rand::thread_rng()
        .sample_iter(Alphanumeric)
        .take(length)
        .map(char::from)
        .collect();
    format!("{}{}", prefix, suffix)
}
