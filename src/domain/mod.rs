pub mod customer;
pub mod money;
pub mod status;
