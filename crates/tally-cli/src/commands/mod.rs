pub mod add;
pub mod clear;
pub mod common;
pub mod conflicts;
pub mod dead_letters;
pub mod edit;
pub mod list;
pub mod remove;
pub mod status;
pub mod sync;
