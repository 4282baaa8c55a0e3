pub mod coordinator;
pub mod mapper;
