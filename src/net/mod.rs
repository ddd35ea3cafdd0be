pub mod packet;
pub mod packet_lib;
