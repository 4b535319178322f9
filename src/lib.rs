pub mod db;
pub mod opportunity_scorer;
pub mod period_compare;
pub mod providers;
pub mod recommendation_cache;
pub mod recommendation_engine;
pub mod token_store;
