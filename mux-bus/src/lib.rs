#![allow(dead_code)]

pub mod engine;
pub mod ffmpeg;
pub mod protocol;
pub mod publisher;
pub mod transcoder;
