pub mod timeparse;
