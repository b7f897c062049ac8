pub mod countdown;
pub mod crypto;
pub mod jwt;
pub mod time;
pub mod validation;
