pub mod mcp;
pub mod server;
