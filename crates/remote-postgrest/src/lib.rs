//! PostgREST-backed implementation of the remote store capability.

mod client;

pub use client::{PostgrestClient, API_KEY_ENV, API_URL_ENV};
