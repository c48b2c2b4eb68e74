pub mod loader;

pub use loader::{DataLoadError, Format, build_environment, load_model, parse_model};
