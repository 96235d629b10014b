pub mod concat;
pub mod manifest;
pub mod parser;
pub mod pipeline;
pub mod progress;
pub mod tts;
pub mod validator;
