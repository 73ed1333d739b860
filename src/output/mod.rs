//! Run output: text summary, JSON summary and the per-item dump

pub mod dump;
pub mod json;
pub mod text;
