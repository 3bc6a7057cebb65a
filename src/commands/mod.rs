pub mod evaluate;
pub mod retrieve;
