//! HTTP ingestion front end
//!
//! In server mode ops arrive one per HTTP POST instead of from a file and
//! are fed to the same scheduler input stream. The client half reads a
//! playback file and posts its ops to such a server.

mod client;
mod server;

pub use client::{IngestClient, SendSummary, send_file};
pub use server::{
    ERROR_BODY, IngestState, SUCCESS_BODY, ingest_router, serve, serve_listener,
};
