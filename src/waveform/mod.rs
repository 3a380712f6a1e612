pub mod decimate;
pub mod extract;
pub mod ingest;
pub mod render;
