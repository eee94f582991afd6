pub mod buffer_ring;
pub mod connection;
pub mod delivery;
pub mod event_loop;
