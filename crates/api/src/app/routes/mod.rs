pub mod books;
pub mod system;
