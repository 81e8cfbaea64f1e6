pub mod authorize;
pub mod device;
pub mod discovery;
pub mod health;
pub mod token;
pub mod userinfo;
