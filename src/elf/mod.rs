pub mod consts;
pub mod dynamic;
pub mod model;
