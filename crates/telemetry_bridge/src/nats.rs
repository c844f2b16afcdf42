mod stream_publisher;

pub use stream_publisher::*;
