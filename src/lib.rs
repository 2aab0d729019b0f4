pub mod backoff;
pub mod config;
pub mod http;
pub mod jobs;
pub mod metrics;
pub mod models;
pub mod pipeline;
pub mod queue;
pub mod recovery;
pub mod remote;
pub mod rollout;
pub mod safety;
pub mod security;
pub mod store;
pub mod supabase;
