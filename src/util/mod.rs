pub mod log;
pub mod rate;

use humansize::{BINARY, format_size};

pub fn human_size(bytes: u64) -> String {
    format_size(bytes, BINARY.decimal_places(2))
}

#[cfg(test)]
pub fn generate_random(size: usize) -> Vec<u8> {
    use rand::Rng;
    let mut data: Vec<u8> = vec![0; size];
    rand::rng().fill(&mut data[..]);
    data
}
