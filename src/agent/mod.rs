pub mod assistants;
pub mod engine;
pub mod relay;
pub mod tools;
