pub mod credential;
pub mod outcome;
pub mod sample;
