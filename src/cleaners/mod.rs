//! Cleaners: per-family transforms from raw envelopes to Silver rows.
//!
//! A cleaner takes one Bronze record and yields `(rows, skipped_count)`.
//! Records it cannot use are skipped and logged, never fatal to the batch.

pub mod macro_series;
pub mod news_feed;
pub mod price_bars;

pub use news_feed::BodyExtractor;
