pub mod ustack;
