pub mod duplicates;
pub mod similarity;

pub use duplicates::{
    choose_keeper, DeduplicationService, KeepStrategy, RemovalItem, RemovalPlan, RemovalStatus,
};
pub use similarity::{hamming_distance, SimilarityIndex, SimilarityMatch};
