pub mod icons;
pub mod progress;
pub mod status;

pub use progress::RunProgressUI;
pub use status::{format_duration, render_view};
