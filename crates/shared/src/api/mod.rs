pub mod device;
pub mod discovery;
pub mod token;
pub mod userinfo;
