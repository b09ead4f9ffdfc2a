use std::cmp;
use std::collections::BTreeMap;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::str;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use anyhow::{anyhow, bail, Result};
use percent_encoding::{percent_encode, AsciiSet, NON_ALPHANUMERIC};
use rand::seq::SliceRandom;
use reqwest::Client;
use tokio::sync::{watch, Notify};
use tokio::time::{sleep_until, Instant};
use url::Url;

use crate::bencoding::Value;
use crate::manager::scheduler::PeerSource;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_INTERVAL: Duration = Duration::from_secs(600); // until a tracker tells us its own
const DEFAULT_MIN_INTERVAL: Duration = Duration::from_secs(30);
const RETRY_INTERVAL: Duration = Duration::from_secs(60); // after every tracker failed
const NUMWANT: u32 = 50;

// unreserved characters stay as they are, everything else is escaped
const QUERY_BYTES: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'.')
    .remove(b'_')
    .remove(b'~');

#[derive(PartialEq, Debug, Clone)]
pub struct Peer {
    pub peer_id: Option<String>,
    pub addr: SocketAddr,
}

#[derive(PartialEq, Debug)]
pub struct OkResponse {
    pub warning_message: Option<String>, // the response is still processed normally
    pub interval: Duration,
    pub min_interval: Option<Duration>,
    pub tracker_id: Option<String>, // to send back on the next announces
    pub complete: Option<i64>,      // seeders
    pub incomplete: Option<i64>,    // leechers
    pub peers: Vec<Peer>,
}

#[derive(PartialEq, Debug)]
pub enum Response {
    Ok(OkResponse),
    Failure(String), // failure reason, no other key is present
}

#[derive(PartialEq, Debug, Clone, Copy)]
pub enum Event {
    None,
    Started,
    Stopped,
    Completed,
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let event = match self {
            Event::None => "",
            Event::Started => "started",
            Event::Stopped => "stopped",
            Event::Completed => "completed",
        };
        write!(f, "{event}")
    }
}

#[derive(PartialEq, Eq, Clone, Copy, Debug, Default)]
pub struct Progress {
    pub downloaded: u64,
    pub uploaded: u64,
    pub left: u64,
}

pub struct TrackerClient {
    client: Client,
    peer_id: [u8; 20],
    tracker_id: Option<String>,
    listening_port: u16,
    trackers_url: Vec<Vec<String>>,
}

impl TrackerClient {
    pub fn new(peer_id: [u8; 20], trackers_url: Vec<Vec<String>>, listening_port: u16) -> Result<Self> {
        let mut randomized_tiers = trackers_url;
        for tier in randomized_tiers.iter_mut() {
            tier.shuffle(&mut rand::rng());
        }
        let client = Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .timeout(REQUEST_TIMEOUT)
            .build()?;
        Ok(TrackerClient {
            client,
            peer_id,
            tracker_id: None,
            listening_port,
            trackers_url: randomized_tiers,
        })
    }

    /// Announces to the first tracker that answers, tier by tier. A tracker
    /// that answers is moved to the front of its tier.
    pub async fn request(
        &mut self,
        info_hash: [u8; 20],
        progress: Progress,
        event: Event,
    ) -> Result<OkResponse> {
        let mut errors = Vec::new();
        for tier_idx in 0..self.trackers_url.len() {
            for tracker_idx in 0..self.trackers_url[tier_idx].len() {
                let url = self.trackers_url[tier_idx][tracker_idx].clone();
                match self
                    .request_to_tracker(&url, info_hash, progress, event)
                    .await
                {
                    Ok(Response::Failure(msg)) => {
                        log::debug!("tracker {url} responded with failure: {msg}");
                        errors.push(format!("tracker {url} failed: \"{msg}\""));
                    }
                    Ok(Response::Ok(response)) => {
                        if let Some(warning_message) = &response.warning_message {
                            log::warn!("tracker {url} warns: {warning_message}");
                        }
                        if response.tracker_id.is_some() {
                            self.tracker_id = response.tracker_id.clone();
                        }
                        if tracker_idx != 0 {
                            let good_tracker = self.trackers_url[tier_idx].remove(tracker_idx);
                            self.trackers_url[tier_idx].insert(0, good_tracker);
                        }
                        return Ok(response);
                    }
                    Err(e) => {
                        log::debug!("error from tracker {url}: {e}");
                        errors.push(format!("tracker {url} errored: \"{e}\""));
                    }
                }
            }
        }
        if errors.is_empty() {
            errors.push("no trackers in list".to_string());
        }
        Err(anyhow!(errors.join("; ")))
    }

    async fn request_to_tracker(
        &self,
        url: &str,
        info_hash: [u8; 20],
        progress: Progress,
        event: Event,
    ) -> Result<Response> {
        if !url.starts_with("http://") && !url.starts_with("https://") {
            // udp and websocket trackers are not spoken
            bail!("scheme of url not supported: {url}");
        }
        let url = self.announce_url(url, info_hash, progress, event)?;
        log::debug!("requesting url: {url}");
        let body = self
            .client
            .get(url)
            .send()
            .await?
            .error_for_status()?
            .bytes()
            .await?;
        parse_response(&body)
    }

    fn announce_url(
        &self,
        announce: &str,
        info_hash: [u8; 20],
        progress: Progress,
        event: Event,
    ) -> Result<Url> {
        let mut url = Url::parse(announce)?;
        // raw bytes are escaped here, the url crate would take them for text
        let binary_params = format!(
            "info_hash={}&peer_id={}",
            percent_encode(&info_hash, QUERY_BYTES),
            percent_encode(&self.peer_id, QUERY_BYTES)
        );
        let query = match url.query() {
            Some(q) if !q.is_empty() => format!("{q}&{binary_params}"),
            _ => binary_params,
        };
        url.set_query(Some(&query));
        {
            let mut pairs = url.query_pairs_mut();
            pairs
                .append_pair("port", &self.listening_port.to_string())
                .append_pair("uploaded", &progress.uploaded.to_string())
                .append_pair("downloaded", &progress.downloaded.to_string())
                .append_pair("left", &progress.left.to_string())
                .append_pair("compact", "1")
                .append_pair("numwant", &NUMWANT.to_string());
            if event != Event::None {
                pairs.append_pair("event", &event.to_string());
            }
            if let Some(tracker_id) = &self.tracker_id {
                pairs.append_pair("trackerid", tracker_id);
            }
        }
        Ok(url)
    }
}

fn utf8_value(map: &BTreeMap<Vec<u8>, Value>, key: &str) -> Result<Option<String>> {
    match map.get(key.as_bytes()) {
        None => Ok(None),
        Some(Value::Str(v)) => match str::from_utf8(v) {
            Ok(s) => Ok(Some(s.to_string())),
            Err(_) => bail!("\"{key}\" key provided in tracker response but it is not an UTF8 string"),
        },
        Some(_) => bail!("\"{key}\" key provided in tracker response but it is not a string"),
    }
}

fn int_value(map: &BTreeMap<Vec<u8>, Value>, key: &str) -> Result<Option<i64>> {
    match map.get(key.as_bytes()) {
        None => Ok(None),
        Some(Value::Int(i)) => Ok(Some(*i)),
        Some(_) => bail!("\"{key}\" key provided in tracker response but it is not a number"),
    }
}

fn seconds(secs: i64) -> Duration {
    Duration::from_secs(u64::try_from(secs).unwrap_or(0))
}

pub fn parse_response(body: &[u8]) -> Result<Response> {
    let response_map = match Value::decode(body)? {
        Value::Dict(m, _, _) => m,
        _ => bail!("the tracker response is not a bencoded dict"),
    };

    if let Some(failure_reason) = utf8_value(&response_map, "failure reason")? {
        return Ok(Response::Failure(failure_reason));
    }

    let Some(interval) = int_value(&response_map, "interval")? else {
        bail!("\"interval\" key not provided in tracker response");
    };

    let peers = match response_map.get(b"peers".as_slice()) {
        Some(Value::List(peers_list)) => get_peers_with_dict_model(peers_list)?,
        Some(Value::Str(peers_bytes)) => get_peers_with_binary_model(peers_bytes)?,
        None => Vec::new(),
        Some(_) => bail!("\"peers\" key provided in tracker response but it is not a list or string"),
    };

    Ok(Response::Ok(OkResponse {
        warning_message: utf8_value(&response_map, "warning message")?,
        interval: seconds(interval),
        min_interval: int_value(&response_map, "min interval")?.map(seconds),
        tracker_id: utf8_value(&response_map, "tracker id")?,
        complete: int_value(&response_map, "complete")?,
        incomplete: int_value(&response_map, "incomplete")?,
        peers,
    }))
}

fn get_peers_with_dict_model(peers_values: &[Value]) -> Result<Vec<Peer>> {
    let mut peers_list = Vec::new();
    for v in peers_values {
        let Value::Dict(peer_dict, _, _) = v else {
            bail!("peers list contains a value that is not a dict");
        };
        let peer_id = peer_dict.get(b"peer id".as_slice()).and_then(|v| match v {
            Value::Str(id) => str::from_utf8(id).ok().map(str::to_string),
            _ => None,
        });
        let Some(ip) = utf8_value(peer_dict, "ip")? else {
            bail!("\"ip\" key not provided in a peer of the tracker response");
        };
        let port = match int_value(peer_dict, "port")? {
            Some(p) => u16::try_from(p)?,
            None => bail!("\"port\" key not provided in a peer of the tracker response"),
        };
        match ip.parse::<IpAddr>() {
            Ok(ip) => peers_list.push(Peer {
                peer_id,
                addr: SocketAddr::new(ip, port),
            }),
            Err(_) => log::debug!("skipping peer with unresolved address {ip}:{port}"),
        }
    }
    Ok(peers_list)
}

fn get_peers_with_binary_model(peers_bytes: &[u8]) -> Result<Vec<Peer>> {
    if peers_bytes.len() % 6 != 0 {
        bail!("peers list is provided in binary model but it is not aligned to 6 bytes");
    }
    Ok(peers_bytes
        .chunks_exact(6)
        .map(|c| Peer {
            peer_id: None,
            addr: SocketAddr::new(
                IpAddr::V4(Ipv4Addr::new(c[0], c[1], c[2], c[3])),
                u16::from_be_bytes([c[4], c[5]]),
            ),
        })
        .collect())
}

#[derive(Default)]
struct Shared {
    new_peers: Vec<SocketAddr>,
    progress: Progress,
}

fn lock(shared: &Mutex<Shared>) -> MutexGuard<'_, Shared> {
    shared.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Scheduler side of the announce task.
pub struct AnnounceHandle {
    shared: Arc<Mutex<Shared>>,
    update: Arc<Notify>,
}

impl PeerSource for AnnounceHandle {
    fn has_new_peers(&self) -> bool {
        !lock(&self.shared).new_peers.is_empty()
    }

    fn take_new_peers(&mut self) -> Vec<SocketAddr> {
        std::mem::take(&mut lock(&self.shared).new_peers)
    }

    fn report_progress(&self, downloaded: u64, uploaded: u64, left: u64) {
        lock(&self.shared).progress = Progress {
            downloaded,
            uploaded,
            left,
        };
    }

    fn request_update(&self) {
        self.update.notify_one();
    }
}

/// Background task announcing to the trackers: `started` first, then
/// regularly or on request, `completed` once the download is done.
pub struct Announcer {
    client: TrackerClient,
    info_hash: [u8; 20],
    shared: Arc<Mutex<Shared>>,
    update: Arc<Notify>,
    completed_sent: bool,
}

impl Announcer {
    pub fn new(client: TrackerClient, info_hash: [u8; 20], initial: Progress) -> (Announcer, AnnounceHandle) {
        let shared = Arc::new(Mutex::new(Shared {
            new_peers: Vec::new(),
            progress: initial,
        }));
        let update = Arc::new(Notify::new());
        let announcer = Announcer {
            client,
            info_hash,
            shared: shared.clone(),
            update: update.clone(),
            completed_sent: initial.left == 0,
        };
        (announcer, AnnounceHandle { shared, update })
    }

    /// Announces until `shutdown` turns true. The `stopped` announce is left
    /// to [`Announcer::stop`] so it can be sent after the links are closed.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> Self {
        let mut event = Event::Started;
        loop {
            let progress = lock(&self.shared).progress;
            if event == Event::None && !self.completed_sent && progress.left == 0 {
                event = Event::Completed;
            }
            let result = tokio::select! {
                r = self.announce(progress, event) => r,
                r = shutdown.changed() => if r.is_err() || *shutdown.borrow() {
                    return self;
                } else {
                    continue;
                },
            };
            let (interval, min_interval) = match result {
                Ok(response) => {
                    if event == Event::Completed {
                        self.completed_sent = true;
                    }
                    event = Event::None;
                    (
                        response.interval,
                        response.min_interval.unwrap_or(DEFAULT_MIN_INTERVAL),
                    )
                }
                Err(e) => {
                    log::warn!("could not announce to any tracker: {e}");
                    (RETRY_INTERVAL, DEFAULT_MIN_INTERVAL)
                }
            };
            if !self.wait(interval, min_interval, &mut shutdown).await {
                return self;
            }
        }
    }

    pub async fn stop(mut self) {
        let progress = lock(&self.shared).progress;
        if let Err(e) = self.announce(progress, Event::Stopped).await {
            log::debug!("could not announce stop: {e}");
        }
    }

    async fn announce(&mut self, progress: Progress, event: Event) -> Result<OkResponse> {
        let response = self.client.request(self.info_hash, progress, event).await?;
        log::info!(
            "announce {}: {} peers, seeders: {:?}, leechers: {:?}, next in {:?}",
            if event == Event::None { "update".to_string() } else { event.to_string() },
            response.peers.len(),
            response.complete,
            response.incomplete,
            response.interval
        );
        let mut shared = lock(&self.shared);
        for peer in &response.peers {
            if !shared.new_peers.contains(&peer.addr) {
                shared.new_peers.push(peer.addr);
            }
        }
        Ok(response)
    }

    // false when shutting down
    async fn wait(
        &self,
        interval: Duration,
        min_interval: Duration,
        shutdown: &mut watch::Receiver<bool>,
    ) -> bool {
        let start = Instant::now();
        let interval = if interval.is_zero() { DEFAULT_INTERVAL } else { interval };
        let mut deadline = start + interval;
        loop {
            tokio::select! {
                _ = sleep_until(deadline) => return true,
                _ = self.update.notified() => {
                    deadline = cmp::min(deadline, start + min_interval);
                }
                r = shutdown.changed() => if r.is_err() || *shutdown.borrow() {
                    return false;
                },
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dict(entries: Vec<(&str, Value)>) -> Value {
        Value::Dict(
            entries
                .into_iter()
                .map(|(k, v)| (k.as_bytes().to_vec(), v))
                .collect(),
            0,
            0,
        )
    }

    fn str_value(s: &str) -> Value {
        Value::Str(s.as_bytes().to_vec())
    }

    #[test]
    fn binary_peer_conversion() {
        let byte_peers = [
            0x1, 0x2, 0x3, 0x4, /* ip 1.2.3.4 */ 0x00, 0x50, /* port 80 */
            0x5, 0x6, 0x7, 0x8, /* ip 5.6.7.8 */ 0x04, 0xbd, /* port 1213 */
        ];
        let expected = vec![
            Peer {
                peer_id: None,
                addr: "1.2.3.4:80".parse().unwrap(),
            },
            Peer {
                peer_id: None,
                addr: "5.6.7.8:1213".parse().unwrap(),
            },
        ];
        assert_matches!(get_peers_with_binary_model(&byte_peers), Ok(peers) => {
            assert_eq!(peers, expected)
        });
        assert!(get_peers_with_binary_model(&byte_peers[..7]).is_err());
    }

    #[test]
    fn dict_peer_conversion_skips_host_names() {
        let peers = vec![
            dict(vec![
                ("ip", str_value("10.1.2.3")),
                ("peer id", str_value("-XX0001-000000000000")),
                ("port", Value::Int(6881)),
            ]),
            dict(vec![("ip", str_value("::1")), ("port", Value::Int(6882))]),
            dict(vec![
                ("ip", str_value("peer.example.org")),
                ("port", Value::Int(6883)),
            ]),
        ];
        let parsed = get_peers_with_dict_model(&peers).unwrap();
        assert_eq!(parsed.len(), 2);
        assert_eq!(parsed[0].addr, "10.1.2.3:6881".parse().unwrap());
        assert_eq!(parsed[0].peer_id.as_deref(), Some("-XX0001-000000000000"));
        assert_eq!(parsed[1].addr, "[::1]:6882".parse().unwrap());
    }

    #[test]
    fn dict_peer_with_bad_port_is_an_error() {
        let peers = vec![dict(vec![
            ("ip", str_value("10.1.2.3")),
            ("port", Value::Int(70000)),
        ])];
        assert!(get_peers_with_dict_model(&peers).is_err());
    }

    #[test]
    fn full_response_is_parsed() {
        let body = dict(vec![
            ("complete", Value::Int(4)),
            ("incomplete", Value::Int(7)),
            ("interval", Value::Int(1800)),
            ("min interval", Value::Int(900)),
            ("peers", Value::Str(vec![127, 0, 0, 1, 0x1a, 0xe1])),
            ("tracker id", str_value("abc")),
            ("warning message", str_value("be nice")),
        ])
        .encode();
        assert_matches!(parse_response(&body), Ok(Response::Ok(ok)) => {
            assert_eq!(ok.interval, Duration::from_secs(1800));
            assert_eq!(ok.min_interval, Some(Duration::from_secs(900)));
            assert_eq!(ok.tracker_id.as_deref(), Some("abc"));
            assert_eq!(ok.warning_message.as_deref(), Some("be nice"));
            assert_eq!((ok.complete, ok.incomplete), (Some(4), Some(7)));
            assert_eq!(ok.peers[0].addr, "127.0.0.1:6881".parse().unwrap());
        });
    }

    #[test]
    fn failure_reason_wins() {
        let body = dict(vec![("failure reason", str_value("unregistered torrent"))]).encode();
        assert_eq!(
            parse_response(&body).unwrap(),
            Response::Failure("unregistered torrent".to_string())
        );
    }

    #[test]
    fn response_without_interval_is_rejected() {
        let body = dict(vec![("peers", Value::Str(Vec::new()))]).encode();
        assert!(parse_response(&body).is_err());
        assert!(parse_response(b"i42e").is_err());
        assert!(parse_response(b"d8:intervali").is_err());
    }

    #[tokio::test]
    async fn announce_url_escapes_binary_params() {
        let client = TrackerClient::new([b'a'; 20], Vec::new(), 6881).unwrap();
        let mut info_hash = [0u8; 20];
        info_hash[0] = 0x12;
        info_hash[1] = b'~';
        info_hash[19] = 0xff;
        let url = client
            .announce_url(
                "http://tracker.example.org/announce?passkey=xyz",
                info_hash,
                Progress {
                    downloaded: 10,
                    uploaded: 20,
                    left: 30,
                },
                Event::Started,
            )
            .unwrap();
        let query = url.query().unwrap();
        assert!(query.starts_with("passkey=xyz&info_hash=%12~%00"));
        assert!(query.contains("%FF&peer_id=aaaaaaaaaaaaaaaaaaaa&port=6881"));
        assert!(query.contains("&uploaded=20&downloaded=10&left=30&compact=1"));
        assert!(query.ends_with("&event=started"));
    }

    #[tokio::test]
    async fn unsupported_schemes_are_skipped() {
        let mut client = TrackerClient::new(
            [b'a'; 20],
            vec![
                vec!["udp://tracker.example.org:80".to_string()],
                vec!["wss://t.example.org".to_string()],
            ],
            6881,
        )
        .unwrap();
        let e = client
            .request([0; 20], Progress::default(), Event::Started)
            .await
            .unwrap_err();
        assert!(e.to_string().contains("scheme of url not supported"));
    }

    #[tokio::test]
    async fn handle_hands_out_announced_peers_once() {
        let client = TrackerClient::new([b'a'; 20], Vec::new(), 6881).unwrap();
        let (_announcer, mut handle) = Announcer::new(client, [0; 20], Progress::default());
        assert!(!handle.has_new_peers());
        lock(&handle.shared).new_peers = vec!["10.0.0.1:1".parse().unwrap()];
        assert!(handle.has_new_peers());
        assert_eq!(handle.take_new_peers().len(), 1);
        assert!(handle.take_new_peers().is_empty());
        handle.report_progress(1, 2, 3);
        assert_eq!(
            lock(&handle.shared).progress,
            Progress {
                downloaded: 1,
                uploaded: 2,
                left: 3
            }
        );
    }

    #[test]
    fn event_query_values() {
        assert_eq!(Event::Started.to_string(), "started");
        assert_eq!(Event::Completed.to_string(), "completed");
        assert_eq!(Event::Stopped.to_string(), "stopped");
        assert_eq!(Event::None.to_string(), "");
    }
}
