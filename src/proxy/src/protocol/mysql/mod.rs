pub mod constants;
pub mod packet;
