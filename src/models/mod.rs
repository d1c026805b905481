pub mod event;
pub mod label;
pub mod outcome;

pub use event::ImageEvent;
pub use label::{Label, LabelResult, ThumbnailRef};
pub use outcome::{BatchRecord, Outcome};
