//! Loading of static UBI volumes straight off raw NAND flash, as needed by boot stages that have
//! no UBI stack of their own.

pub mod nand;
pub mod ubi;
