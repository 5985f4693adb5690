pub mod app;
pub mod chart;
pub mod color;
pub mod costs;
pub mod data;
pub mod error;
pub mod ui;

pub use app::plot_training;
pub use data::loader::{load_archive, load_binary, load_multiclass, save_json_gz};
pub use data::model::{MnistArchive, RawSplit, TaskData};
pub use error::DataError;
