pub mod evidence;
pub mod types;
