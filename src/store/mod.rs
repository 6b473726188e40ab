pub mod atomic;
pub mod index;
pub mod meta;
pub mod transcript;
