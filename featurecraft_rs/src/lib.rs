pub mod config;
pub mod engine;
pub mod panel;
pub mod pipeline;
pub mod rolling;
pub mod s3;

pub use config::Config;
pub use engine::FeatureEngine;
pub use panel::PanelData;
pub use pipeline::run_feature_pipeline;
