pub mod hasher;
pub mod scanner;
pub mod tagger;
