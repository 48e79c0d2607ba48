pub mod toml_loader;

pub use toml_loader::{load_all_intake_files, load_intake_file, IntakeRequest};
