//! 音频解码模块

mod decoder;

pub use decoder::{AudioDecoder, DecodeError, DecoderIterator, SourceInfo};
