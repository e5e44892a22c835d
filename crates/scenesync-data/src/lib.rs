pub mod loader;
pub mod schema;

pub use loader::{load_scene_data, DataLoadError, SceneData};
