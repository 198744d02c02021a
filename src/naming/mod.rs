mod filters;
mod sanitize;
mod template;

pub use filters::{NameFilter, apply_filters};
pub use sanitize::{DEFAULT_MAX_LENGTH, INVALID_CHAR_REPLACEMENT, TEMP_SUFFIX, safe_filename, safe_name};
pub use template::{NamingOptions, episode_number, render_folder, render_item_path};
