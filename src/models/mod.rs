// src/models/mod.rs

// 1. Объявляем модули
pub mod movement;
pub mod node;
pub mod stock;

// 2. Ре-экспортируем содержимое, чтобы структуры были доступны как crate::models::StructName
pub use movement::*;
pub use node::*;
pub use stock::*;
