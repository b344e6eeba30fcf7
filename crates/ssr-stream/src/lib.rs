//! Streaming response machinery for the SSR web server: the encoder-stage
//! pipe that turns a source byte stream into a timed, content-coded
//! response (§4.7), and the single-slot producer/consumer channel the
//! sitemap route drains to reconcile discovered paths against storage
//! (§4.8).

pub mod pipe;
pub mod sitemap;

pub use pipe::{pipe, Encoding, PipeError, PipeTimeouts};
pub use sitemap::{
    channel, encode, spawn_stream, Batch, Cancelled, Consumer, Generator, Producer, ReadOutcome,
    RenderedEntry, SitemapEntry,
};
