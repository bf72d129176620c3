pub mod frame;
pub mod types;

pub use frame::{Command, Decoded, Frame, FrameError};
pub use types::{DecodeStrategy, DogePhotoPayload, Notification, DOGE_PHOTO_URI_FIELD};
