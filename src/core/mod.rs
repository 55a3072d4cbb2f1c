pub mod catalog;
pub mod hash;
pub mod index;
pub mod scanner;
pub mod shared;
pub mod snapshot;
