pub mod container;
pub mod listener;
pub mod scanner;
pub mod tailer;

pub use container::{ContainerTailer, NoopTagger, Tagger};
pub use listener::Listener;
pub use scanner::Scanner;
pub use tailer::Tailer;
