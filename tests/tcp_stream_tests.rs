use anyhow::Result;
use sockbuf::config::SocketConfig;
use sockbuf::{AddressFamily, ReceivePattern, SocketOption, TcpClient, TcpMaster, TcpServer};
use std::io::{Read, Write};
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream};
use std::thread;
use std::time::Duration;
use test_log::test;

fn listener() -> Result<(TcpListener, SocketAddr)> {
    let listener = TcpListener::bind("127.0.0.1:0")?;
    let addr = listener.local_addr()?;
    Ok((listener, addr))
}

fn connect(addr: SocketAddr) -> Result<TcpClient> {
    let mut master = TcpMaster::new_v4()?;
    master.settimeout(Some(2.0), None);
    Ok(master.connect(addr)?)
}

fn server() -> Result<(TcpServer, SocketAddr)> {
    let mut master = TcpMaster::new_v4()?;
    master.bind("127.0.0.1:0".parse()?)?;
    let server = master.listen()?;
    let addr = server.getsockname()?;
    Ok((server, addr))
}

#[test]
fn test_line_and_exact_patterns() -> Result<()> {
    let (listener, addr) = listener()?;
    let peer = thread::spawn(move || -> std::io::Result<()> {
        let (mut stream, _) = listener.accept()?;
        stream.write_all(b"HELLO\r\nworld\n")?;
        stream.write_all(b"0123456789")?;
        stream.write_all(b"tail bytes")?;
        Ok(())
    });

    let mut client = connect(addr)?;
    client.settimeout(Some(2.0), None);
    assert_eq!(client.receive_line()?, b"HELLO");
    assert_eq!(client.receive_line()?, b"world");
    assert_eq!(client.receive_exact(10)?, b"0123456789");
    assert_eq!(
        client.receive(ReceivePattern::All, b"> ")?,
        b"> tail bytes"
    );
    assert_eq!(client.getstats().bytes_received, 33);
    peer.join().unwrap()?;
    Ok(())
}

#[test]
fn test_accept_and_echo() -> Result<()> {
    let (mut server, addr) = server()?;
    server.settimeout(Some(2.0), None);
    let peer = thread::spawn(move || -> std::io::Result<Vec<u8>> {
        let mut stream = TcpStream::connect(addr)?;
        stream.write_all(b"ping\n")?;
        let mut reply = Vec::new();
        stream.read_to_end(&mut reply)?;
        Ok(reply)
    });

    let mut client = server.accept()?;
    assert_eq!(client.timeouts(), (None, None));
    client.settimeout(Some(2.0), None);
    let line = client.receive_line()?;
    assert_eq!(line, b"ping");
    let data = b"--pong--";
    assert_eq!(client.send(data, 3, -3)?, 4);
    assert_eq!(client.getstats().bytes_sent, 4);
    client.shutdown(Shutdown::Write)?;

    assert_eq!(peer.join().unwrap()?, b"pong");
    assert_eq!(client.getpeername()?.ip(), addr.ip());
    assert_eq!(client.getsockname()?, addr);
    Ok(())
}

#[test]
fn test_accept_timeout() -> Result<()> {
    let (mut server, _) = server()?;
    server.settimeout(Some(0.05), None);
    let err = server.accept().err().expect("no client connected");
    assert!(err.is_timeout());
    Ok(())
}

#[test]
fn test_block_timeout_keeps_partial() -> Result<()> {
    let (listener, addr) = listener()?;
    let peer = thread::spawn(move || -> std::io::Result<TcpStream> {
        let (mut stream, _) = listener.accept()?;
        stream.write_all(b"abc")?;
        Ok(stream)
    });

    let mut client = connect(addr)?;
    client.settimeout(Some(0.1), None);
    let err = client.receive_exact(6).unwrap_err();
    assert!(err.error.is_timeout());
    assert_eq!(err.partial, b"abc");

    let mut stream = peer.join().unwrap()?;
    stream.write_all(b"def")?;
    client.settimeout(Some(2.0), None);
    assert_eq!(
        client.receive(ReceivePattern::Exact(3), &err.partial)?,
        b"abcdef"
    );
    Ok(())
}

#[test]
fn test_total_timeout_bounds_operation() -> Result<()> {
    let (listener, addr) = listener()?;
    let peer = thread::spawn(move || -> std::io::Result<()> {
        let (mut stream, _) = listener.accept()?;
        for _ in 0..20 {
            if stream.write_all(b"x").is_err() {
                break;
            }
            thread::sleep(Duration::from_millis(50));
        }
        Ok(())
    });

    let mut client = connect(addr)?;
    client.settimeout(Some(1.0), Some(0.2));
    let err = client.receive_exact(20).unwrap_err();
    assert!(err.error.is_timeout());
    assert!(!err.partial.is_empty());
    assert!(err.partial.len() < 20);
    client.close();
    peer.join().unwrap()?;
    Ok(())
}

#[test]
fn test_send_timeout_reports_progress() -> Result<()> {
    let (listener, addr) = listener()?;
    let peer = thread::spawn(move || -> std::io::Result<TcpStream> {
        let (stream, _) = listener.accept()?;
        Ok(stream)
    });

    let mut client = connect(addr)?;
    let _idle_peer = peer.join().unwrap()?;
    client.settimeout(Some(0.1), None);
    let data = vec![0x5a; 32 * 1024 * 1024];
    let err = client.send_all(&data).unwrap_err();
    assert!(err.error.is_timeout());
    assert!(err.partial > 0);
    assert!(err.partial < data.len());
    assert_eq!(client.getstats().bytes_sent, err.partial as u64);
    Ok(())
}

#[test]
fn test_peer_close_is_closed() -> Result<()> {
    let (listener, addr) = listener()?;
    let peer = thread::spawn(move || -> std::io::Result<()> {
        let (mut stream, _) = listener.accept()?;
        stream.write_all(b"no newline")?;
        Ok(())
    });

    let mut client = connect(addr)?;
    peer.join().unwrap()?;
    let err = client.receive_line().unwrap_err();
    assert!(err.error.is_closed());
    assert_eq!(err.partial, b"no newline");
    Ok(())
}

#[test]
fn test_close_is_idempotent() -> Result<()> {
    let (_listener, addr) = listener()?;
    let mut client = connect(addr)?;
    client.close();
    client.close();
    assert!(client.receive_exact(1).unwrap_err().error.is_closed());
    assert!(client.send_all(b"x").unwrap_err().error.is_closed());
    assert!(client.getpeername().unwrap_err().is_closed());

    let mut master = TcpMaster::new_v4()?;
    master.close();
    master.close();
    assert!(master.getsockname().unwrap_err().is_closed());
    Ok(())
}

#[test]
fn test_connect_refused() -> Result<()> {
    let (listener, addr) = listener()?;
    drop(listener);
    let master = TcpMaster::new_v4()?;
    let err = master.connect(addr).err().expect("nothing is listening");
    assert!(matches!(err.error, sockbuf::SocketError::Refused), "{err:?}");
    let mut master = err.master;
    master.close();
    assert!(master.getsockname().unwrap_err().is_closed());
    Ok(())
}

#[test]
fn test_connect_timeout_can_resume() -> Result<()> {
    let cfg = SocketConfig::from_yaml("backlog: 1")?;
    let mut master = TcpMaster::with_config(AddressFamily::Inet, &cfg)?;
    master.bind("127.0.0.1:0".parse()?)?;
    let mut server = master.listen()?;
    let addr = server.getsockname()?;

    // fill the accept queue until a handshake is left pending
    let mut queued = Vec::new();
    let mut pending = None;
    for _ in 0..16 {
        let mut master = TcpMaster::new_v4()?;
        master.settimeout(Some(0.05), None);
        match master.connect(addr) {
            Ok(client) => queued.push(client),
            Err(err) => {
                assert!(err.is_timeout(), "{err:?}");
                pending = Some(err.master);
                break;
            }
        }
    }
    let mut master = pending.expect("accept queue never filled");
    assert!(!queued.is_empty());

    server.settimeout(Some(2.0), None);
    let _first = server.accept()?;
    master.settimeout(Some(5.0), None);
    let mut client = master.connect(addr)?;
    assert_eq!(client.getpeername()?, addr);
    client.close();
    Ok(())
}

#[test]
fn test_with_config() -> Result<()> {
    let cfg = SocketConfig::from_yaml(
        r#"
timeouts:
  block: 0.05
noDelay: true
keepAlive: true
backlog: 4
"#,
    )?;
    let mut master = TcpMaster::with_config(AddressFamily::Inet, &cfg)?;
    master.bind("127.0.0.1:0".parse()?)?;
    let mut server = master.listen()?;
    let err = server.accept().err().expect("no client connected");
    assert!(err.is_timeout());
    server.set_option(SocketOption::ReuseAddr(true))?;
    server.close();
    Ok(())
}
