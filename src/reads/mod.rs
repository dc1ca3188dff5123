mod read;

pub use read::{Attributes, Read, ReadPair};
