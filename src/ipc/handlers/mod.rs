pub mod assignments;
pub mod core;
pub mod courses;
pub mod grades;
pub mod outcomes;
pub mod sync_canvas;
pub mod users;
