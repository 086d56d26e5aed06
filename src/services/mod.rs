pub mod capabilities;
pub mod encryption;
pub mod job_store;
pub mod jobs;
pub mod narrator;
pub mod ocr;
pub mod queue;
pub mod storage;
pub mod translator;
pub mod tts;
pub mod workers_ai;
