//! Comic-to-speech pipeline
//!
//! Comic pages are submitted over HTTP, queued, and processed by workers that
//! narrate the page (vision-language model, falling back to OCR), optionally
//! translate the narration, and synthesize it to speech. Job state lives in
//! PostgreSQL, source images and audio in R2, and the queue in Redis.

pub mod app_state;
pub mod config;
pub mod db;
pub mod models;
pub mod pipeline;
pub mod routes;
pub mod services;
pub mod worker;
