pub mod json;
pub mod video_list;
