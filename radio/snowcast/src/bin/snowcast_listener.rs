//! Station listener: binds a UDP port and copies every received datagram to
//! stdout, where it can be piped into a player.

use clap::{App, Arg};
use std::io;
use std::io::Write;
use std::process;

fn main() {
    let matches = App::new("snowcast_listener")
        .version("1.0")
        .about("Writes a station's UDP stream to stdout.")
        .arg(
            Arg::with_name("UDP_PORT")
                .help("UDP port to receive the stream on")
                .required(true),
        )
        .get_matches();

    let port: u16 = match matches.value_of("UDP_PORT").unwrap().parse() {
        Ok(port) => port,
        Err(_) => {
            eprintln!("UDP_PORT must be a number in [0, 65536)");
            process::exit(1);
        }
    };

    let socket = match frost::net::udp_listener(port) {
        Ok(socket) => socket,
        Err(err) => {
            eprintln!("Could not bind UDP port {}: {}", port, err);
            process::exit(1);
        }
    };

    let stdout = io::stdout();
    let mut out = stdout.lock();
    let mut buf = [0u8; 2048];
    loop {
        match socket.recv_from(&mut buf) {
            Ok((count, _)) => {
                if out.write_all(&buf[..count]).is_err() {
                    // Downstream player went away; nothing left to do.
                    process::exit(0);
                }
            }
            Err(err) => {
                eprintln!("recv failed: {}", err);
                process::exit(1);
            }
        }
    }
}
