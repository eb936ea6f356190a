use std::io::Write;
use std::net::TcpStream;

use crate::*;

/// SIGTERM ends live sessions through the normal teardown path.
#[test]
fn test_sigterm_tears_down_sessions() {
    if !skip_unless_built() {
        return;
    }

    let upstream = FakeAggregator::start();
    let mut daemon = Daemon::spawn(upstream.port, 30).expect("daemon should start");
    let frames = sample_frames();

    let mut feeder = TcpStream::connect(daemon.listen).unwrap();
    feeder.write_all(&frames).unwrap();
    assert!(wait_until(Duration::from_secs(5), || upstream.received() == frames));

    let status = daemon.terminate().expect("daemon should stop");
    assert!(status.success(), "beastd exited with {status}");

    let db = daemon.db();
    let (bytes, transferred): (i64, i64) = db
        .query_row(
            "SELECT f.bytes_received, c.bytes_transferred
             FROM feeders f JOIN connections c ON c.feeder_id = f.id
             WHERE c.disconnected_at IS NOT NULL",
            [],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .unwrap();
    assert_eq!(bytes, frames.len() as i64);
    assert_eq!(transferred, frames.len() as i64);

    drop(feeder);
}
