pub mod feedback;
pub mod review;
pub mod user;
