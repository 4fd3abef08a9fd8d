pub mod mysql;
pub mod packet_io;
