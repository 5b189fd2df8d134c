pub mod discretiser;
pub mod lengths;
pub mod mpr;
pub mod point;
pub mod rbtree;
pub mod times;
