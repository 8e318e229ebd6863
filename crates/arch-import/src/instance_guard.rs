//! Coarse single-instance check: a second listener on the same port means
//! another copy is already running.

use std::net::TcpListener;

pub fn port_in_use(host: &str, port: u16) -> bool {
    TcpListener::bind((host, port)).is_err()
}
