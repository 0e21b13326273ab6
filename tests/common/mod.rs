// In-memory Tesira device used by the integration tests.
#![allow(dead_code)]

use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::io;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tesira_ttp::{Connector, DspConfig, ReconnectConfig, SessionConfig};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

pub const HOSTNAME: &str = "TesiraServer91";
pub const SERIAL: &str = "03441445";
pub const VERSION: &str = "4.7.1.23";

// ── Configuration ───────────────────────────────────────────────────

pub fn session_config() -> SessionConfig {
    SessionConfig::default()
        .with_request_timeout(Duration::from_secs(1))
        .with_connect_retries(0)
        .with_reconnect(ReconnectConfig {
            enabled: true,
            initial_delay: Duration::from_millis(20),
            max_delay: Duration::from_millis(100),
            max_retries: 5,
        })
}

pub fn dsp_config() -> DspConfig {
    DspConfig::default().with_session(session_config())
}

/// Poll `condition` until it holds, failing the test after two seconds
pub async fn eventually(what: &str, condition: impl Fn() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while !condition() {
        if tokio::time::Instant::now() > deadline {
            panic!("timed out waiting for {what}");
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

// ── Fake device ─────────────────────────────────────────────────────

struct FakeBlock {
    type_tag: String,
    values: BTreeMap<String, Value>,
}

struct FakeSubscription {
    block: String,
    attribute: String,
    index: Option<u32>,
    token: String,
}

struct Model {
    hostname: String,
    aliases: Vec<String>,
    blocks: BTreeMap<String, FakeBlock>,
    faults: Value,
    subscriptions: Vec<FakeSubscription>,
    log: Vec<String>,
    connections: usize,
    refuse: bool,
    echo: bool,
    silent: Vec<String>,
    push: Option<mpsc::UnboundedSender<String>>,
    server: Option<JoinHandle<()>>,
}

/// A scripted Tesira server speaking TTP over an in-memory duplex pipe
#[derive(Clone)]
pub struct FakeTesira {
    model: Arc<Mutex<Model>>,
}

fn block(type_tag: &str, values: Vec<(String, Value)>) -> FakeBlock {
    FakeBlock {
        type_tag: type_tag.to_string(),
        values: values.into_iter().collect(),
    }
}

fn per_index(attribute: &str, values: &[Value]) -> Vec<(String, Value)> {
    values
        .iter()
        .enumerate()
        .map(|(i, v)| (format!("{attribute} {}", i + 1), v.clone()))
        .collect()
}

fn single(attribute: &str, value: Value) -> Vec<(String, Value)> {
    vec![(attribute.to_string(), value)]
}

impl FakeTesira {
    /// Device with one block of each supported type plus an unsupported one
    ///
    /// - `LevelTest`: LevelControl, 2 channels, levels -10 / -12
    /// - `MuteTest`: MuteControl, 2 channels, no label on channel 2
    /// - `SourceTest`: mono SourceSelector, 3 sources, source 1 selected
    /// - `DanteIn`: DanteInput, 2 channels
    /// - `GeqTest`: GraphicEqualizer, 3 bands
    /// - `OutputTest`: AudioOutput, 2 channels, channel 2 inverted
    /// - `NoiseGen`: NoiseGenerator, 1 channel at -30
    /// - `DuckerTest`: Ducker
    /// - `Combiner`: RoomCombiner (unsupported)
    pub fn new() -> Self {
        let mut blocks = BTreeMap::new();

        let mut values = single("numChannels", json!(2));
        values.extend(per_index("label", &[json!("Mic 1"), json!("Mic 2")]));
        values.extend(per_index("minLevel", &[json!(-100.0), json!(-100.0)]));
        values.extend(per_index("maxLevel", &[json!(12.0), json!(12.0)]));
        values.extend(per_index("level", &[json!(-10.0), json!(-12.0)]));
        values.extend(per_index("mute", &[json!(false), json!(false)]));
        blocks.insert("LevelTest".to_string(), block("LevelControl", values));

        let mut values = single("numChannels", json!(2));
        values.extend(single("ganged", json!(false)));
        values.extend(per_index("label", &[json!("Zone A")]));
        values.extend(per_index("mute", &[json!(false), json!(true)]));
        blocks.insert("MuteTest".to_string(), block("MuteControl", values));

        let mut values = single("stereoEnable", json!(false));
        values.extend(single("numInputs", json!(3)));
        values.extend(single("numOutputs", json!(1)));
        values.extend(per_index("label", &[json!("Mic"), json!("Laptop"), json!("Music")]));
        values.extend(per_index("sourceMinLevel", &[json!(-100.0), json!(-100.0), json!(-100.0)]));
        values.extend(per_index("sourceMaxLevel", &[json!(12.0), json!(12.0), json!(12.0)]));
        values.extend(per_index("sourceLevel", &[json!(-5.0), json!(-6.0), json!(-7.0)]));
        values.extend(single("outputMinLevel", json!(-100.0)));
        values.extend(single("outputMaxLevel", json!(12.0)));
        values.extend(single("outputLevel", json!(0.0)));
        values.extend(single("outputMute", json!(false)));
        values.extend(single("sourceSelection", json!(1)));
        blocks.insert("SourceTest".to_string(), block("SourceSelector", values));

        let mut values = single("numChannels", json!(2));
        values.extend(per_index("channelName", &[json!("Stage L"), json!("Stage R")]));
        values.extend(per_index("minLevel", &[json!(-100.0), json!(-100.0)]));
        values.extend(per_index("maxLevel", &[json!(12.0), json!(12.0)]));
        values.extend(per_index("level", &[json!(0.0), json!(0.0)]));
        values.extend(per_index("mute", &[json!(false), json!(false)]));
        values.extend(per_index("invert", &[json!(false), json!(false)]));
        values.extend(per_index("faultOnInactive", &[json!(false), json!(false)]));
        blocks.insert("DanteIn".to_string(), block("DanteInput", values));

        let mut values = single("numBands", json!(3));
        values.extend(single("minGain", json!(-15.0)));
        values.extend(single("maxGain", json!(15.0)));
        values.extend(single("bypassAll", json!(false)));
        values.extend(per_index("bypass", &[json!(false), json!(true), json!(false)]));
        values.extend(per_index("gain", &[json!(0.0), json!(-2.0), json!(1.5)]));
        blocks.insert("GeqTest".to_string(), block("GraphicEqualizer", values));

        let mut values = single("numChannels", json!(2));
        values.extend(per_index("minLevel", &[json!(-100.0), json!(-100.0)]));
        values.extend(per_index("maxLevel", &[json!(12.0), json!(12.0)]));
        values.extend(per_index("level", &[json!(0.0), json!(-3.0)]));
        values.extend(per_index("mute", &[json!(false), json!(false)]));
        values.extend(per_index("invert", &[json!(false), json!(true)]));
        blocks.insert("OutputTest".to_string(), block("AudioOutput", values));

        let mut values = single("numChannels", json!(1));
        values.extend(per_index("minLevel", &[json!(-100.0)]));
        values.extend(per_index("maxLevel", &[json!(0.0)]));
        values.extend(per_index("level", &[json!(-30.0)]));
        values.extend(per_index("mute", &[json!(true)]));
        blocks.insert("NoiseGen".to_string(), block("NoiseGenerator", values));

        let values = vec![
            ("bypass".to_string(), json!(false)),
            ("mixSense".to_string(), json!(false)),
            ("senseLevel".to_string(), json!(0.0)),
            ("senseMute".to_string(), json!(false)),
            ("threshold".to_string(), json!(-30.0)),
            ("duckingLevel".to_string(), json!(-20.0)),
            ("attackTime".to_string(), json!(10.0)),
            ("releaseTime".to_string(), json!(500.0)),
            ("inputMute".to_string(), json!(false)),
            ("inputLevel".to_string(), json!(-6.0)),
            ("minInputLevel".to_string(), json!(-100.0)),
            ("maxInputLevel".to_string(), json!(12.0)),
        ];
        blocks.insert("DuckerTest".to_string(), block("Ducker", values));

        blocks.insert("Combiner".to_string(), block("RoomCombiner", Vec::new()));

        let aliases = [
            "device",
            "LevelTest",
            "MuteTest",
            "SourceTest",
            "DanteIn",
            "GeqTest",
            "OutputTest",
            "NoiseGen",
            "DuckerTest",
            "Combiner",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();

        Self {
            model: Arc::new(Mutex::new(Model {
                hostname: HOSTNAME.to_string(),
                aliases,
                blocks,
                faults: json!([{
                    "id": "INDICATOR_NONE_IN_DEVICE",
                    "name": "No fault in device",
                    "faults": [],
                    "serialNumber": SERIAL
                }]),
                subscriptions: Vec::new(),
                log: Vec::new(),
                connections: 0,
                refuse: false,
                echo: false,
                silent: Vec::new(),
                push: None,
                server: None,
            })),
        }
    }

    /// Connector that opens a fresh duplex connection to this device
    pub fn connector(&self) -> impl Connector {
        let fake = self.clone();
        move || {
            let fake = fake.clone();
            async move { fake.accept() }
        }
    }

    fn accept(&self) -> io::Result<DuplexStream> {
        let mut model = self.model.lock().unwrap();
        if model.refuse {
            return Err(io::Error::new(io::ErrorKind::ConnectionRefused, "connection refused"));
        }

        let (client, server) = tokio::io::duplex(64 * 1024);
        let (push_tx, push_rx) = mpsc::unbounded_channel();
        model.connections += 1;
        model.push = Some(push_tx);
        model.subscriptions.clear();
        let handle = tokio::spawn(serve(self.clone(), server, push_rx));
        if let Some(previous) = model.server.replace(handle) {
            previous.abort();
        }
        Ok(client)
    }

    // ── Test controls ───────────────────────────────────────────────

    /// Every command line received, in order
    pub fn commands(&self) -> Vec<String> {
        self.model.lock().unwrap().log.clone()
    }

    /// Number of received commands containing `needle`
    pub fn count(&self, needle: &str) -> usize {
        self.model
            .lock()
            .unwrap()
            .log
            .iter()
            .filter(|line| line.contains(needle))
            .count()
    }

    pub fn clear_log(&self) {
        self.model.lock().unwrap().log.clear();
    }

    pub fn connections(&self) -> usize {
        self.model.lock().unwrap().connections
    }

    /// Subscriptions registered on the current connection
    pub fn subscription_count(&self) -> usize {
        self.model.lock().unwrap().subscriptions.len()
    }

    /// Never answer commands containing `needle`
    pub fn silence(&self, needle: &str) {
        self.model.lock().unwrap().silent.push(needle.to_string());
    }

    /// Echo each command line back before answering it
    pub fn set_echo(&self, echo: bool) {
        self.model.lock().unwrap().echo = echo;
    }

    /// Refuse new connections
    pub fn set_refuse(&self, refuse: bool) {
        self.model.lock().unwrap().refuse = refuse;
    }

    pub fn set_faults(&self, faults: Value) {
        self.model.lock().unwrap().faults = faults;
    }

    pub fn value(&self, block: &str, key: &str) -> Option<Value> {
        let model = self.model.lock().unwrap();
        model.blocks.get(block)?.values.get(key).cloned()
    }

    /// Make an attribute unknown so that reads and writes of it fail
    pub fn remove_value(&self, block: &str, key: &str) {
        let mut model = self.model.lock().unwrap();
        if let Some(b) = model.blocks.get_mut(block) {
            b.values.remove(key);
        }
    }

    /// Write a raw line to the client
    pub fn push(&self, line: &str) {
        let model = self.model.lock().unwrap();
        if let Some(push) = &model.push {
            let _ = push.send(line.to_string());
        }
    }

    /// Change a value on the device side (e.g. from the front panel) and
    /// publish it to matching subscriptions
    pub fn change(&self, block: &str, key: &str, value: Value) {
        let mut model = self.model.lock().unwrap();
        if let Some(b) = model.blocks.get_mut(block) {
            b.values.insert(key.to_string(), value);
        }
        let (attribute, index) = split_key(key);
        let publishes = model.publishes(block, attribute, index);
        if let Some(push) = &model.push {
            for line in publishes {
                let _ = push.send(line);
            }
        }
    }

    /// Close the current connection from the device side
    pub fn drop_connection(&self) {
        let mut model = self.model.lock().unwrap();
        model.push = None;
        model.subscriptions.clear();
        if let Some(server) = model.server.take() {
            server.abort();
        }
    }

    fn handle(&self, line: &str) -> Vec<String> {
        let mut model = self.model.lock().unwrap();
        model.log.push(line.to_string());

        let mut out = Vec::new();
        if model.echo {
            out.push(line.to_string());
        }
        if model.silent.iter().any(|needle| line.contains(needle.as_str())) {
            return out;
        }

        let tokens = tokenize(line);
        if line.starts_with('"') {
            model.handle_block(&tokens, &mut out);
        } else {
            model.handle_device(&tokens, &mut out);
        }
        out
    }
}

async fn serve(fake: FakeTesira, stream: DuplexStream, mut pushes: mpsc::UnboundedReceiver<String>) {
    let (read, mut write) = tokio::io::split(stream);
    let mut lines = BufReader::new(read).lines();

    if write
        .write_all(b"Welcome to the Tesira Text Protocol Server...\r\n")
        .await
        .is_err()
    {
        return;
    }

    loop {
        let out = tokio::select! {
            line = lines.next_line() => match line {
                Ok(Some(line)) => fake.handle(line.trim()),
                _ => break,
            },
            Some(line) = pushes.recv() => vec![line],
        };
        for line in out {
            if write.write_all(format!("{line}\r\n").as_bytes()).await.is_err() {
                return;
            }
        }
    }
}

impl Model {
    fn handle_device(&mut self, tokens: &[String], out: &mut Vec<String>) {
        let words: Vec<&str> = tokens.iter().map(String::as_str).collect();
        let reply = match words.as_slice() {
            ["SESSION", "set", ..] => "+OK".to_string(),
            ["SESSION", "get", "aliases"] => {
                let list: Vec<Value> = self.aliases.iter().map(|a| json!(a)).collect();
                format!("+OK \"list\":{}", encode(&Value::Array(list)))
            }
            ["DEVICE", "get", attribute] => {
                let value = match *attribute {
                    "hostname" => json!(self.hostname),
                    "version" => json!(VERSION),
                    "serialNumber" => json!(SERIAL),
                    "activeFaultList" => self.faults.clone(),
                    "networkStatus" => json!({"hostname": self.hostname, "defaultGatewayV4": "10.0.0.1"}),
                    "discoveredServers" => json!([{"hostname": self.hostname, "serialNumber": SERIAL}]),
                    _ => {
                        out.push(format!("-ERR unknown attribute {attribute}"));
                        return;
                    }
                };
                format!("+OK \"value\":{}", encode(&value))
            }
            ["DEVICE", "startAudio" | "stopAudio" | "reboot"] => "+OK".to_string(),
            _ => "-ERR invalid command".to_string(),
        };
        out.push(reply);
    }

    fn handle_block(&mut self, tokens: &[String], out: &mut Vec<String>) {
        let [id, verb, attribute, args @ ..] = tokens else {
            out.push("-ERR invalid command".to_string());
            return;
        };
        let Some(block) = self.blocks.get_mut(id.as_str()) else {
            out.push(r#"-ERR address not found: {"deviceId":0 "classCode":0 "instanceNum":0}"#.to_string());
            return;
        };

        match verb.as_str() {
            "get" if attribute == "BLOCKTYPE" => {
                out.push(format!(
                    "-ERR Unknown attribute BLOCKTYPE in {}Interface::Attributes",
                    block.type_tag
                ));
            }
            "get" => {
                let key = match args.first() {
                    Some(index) => format!("{attribute} {index}"),
                    None => attribute.clone(),
                };
                match block.values.get(&key) {
                    Some(value) => out.push(format!("+OK \"value\":{}", encode(value))),
                    None => out.push(format!("-ERR attribute not found: {key}")),
                }
            }
            "set" => {
                let (key, index, raw) = match args {
                    [index, raw] => (format!("{attribute} {index}"), index.parse::<u32>().ok(), raw),
                    [raw] => (attribute.clone(), None, raw),
                    _ => {
                        out.push("-ERR invalid set".to_string());
                        return;
                    }
                };
                if !block.values.contains_key(&key) {
                    out.push(format!("-ERR attribute not found: {key}"));
                    return;
                }
                block.values.insert(key, parse_word(raw));
                out.push("+OK".to_string());
                let publishes = self.publishes(id, attribute, index);
                out.extend(publishes);
            }
            "subscribe" => {
                let (index, token) = match args {
                    [index, token, ..] if index.parse::<u32>().is_ok() => (index.parse::<u32>().ok(), token),
                    [token, ..] => (None, token),
                    [] => {
                        out.push("-ERR missing token".to_string());
                        return;
                    }
                };
                let token = token.clone();
                self.subscriptions.retain(|s| s.token != token);
                self.subscriptions.push(FakeSubscription {
                    block: id.clone(),
                    attribute: attribute.clone(),
                    index,
                    token,
                });
                out.push("+OK".to_string());
            }
            "unsubscribe" => {
                let token = args.last();
                self.subscriptions.retain(|s| {
                    !(s.block == *id && s.attribute == *attribute && token.map_or(true, |t| *t == s.token))
                });
                out.push("+OK".to_string());
            }
            _ => out.push("-ERR invalid verb".to_string()),
        }
    }

    /// Publish lines caused by a change of `attribute [index]` on `block`
    fn publishes(&self, block: &str, attribute: &str, index: Option<u32>) -> Vec<String> {
        let Some(values) = self.blocks.get(block).map(|b| &b.values) else {
            return Vec::new();
        };

        let mut lines = Vec::new();
        for sub in self.subscriptions.iter().filter(|s| s.block == block) {
            let value = if sub.attribute == attribute && sub.index == index {
                let key = match index {
                    Some(i) => format!("{attribute} {i}"),
                    None => attribute.to_string(),
                };
                values.get(&key).cloned()
            } else if index.is_some() && sub.index.is_none() && sub.attribute == format!("{attribute}s") {
                let all: Vec<Value> = (1..)
                    .map_while(|i| values.get(&format!("{attribute} {i}")).cloned())
                    .collect();
                Some(Value::Array(all))
            } else {
                None
            };
            if let Some(value) = value {
                lines.push(format!(
                    "! \"publishToken\":\"{}\" \"value\":{}",
                    sub.token,
                    encode(&value)
                ));
            }
        }
        lines
    }
}

fn split_key(key: &str) -> (&str, Option<u32>) {
    match key.split_once(' ') {
        Some((attribute, index)) => (attribute, index.parse().ok()),
        None => (key, None),
    }
}

fn tokenize(line: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut chars = line.chars().peekable();
    while let Some(&c) = chars.peek() {
        if c.is_whitespace() {
            chars.next();
            continue;
        }
        let mut token = String::new();
        if c == '"' {
            chars.next();
            while let Some(c) = chars.next() {
                match c {
                    '\\' => {
                        if let Some(escaped) = chars.next() {
                            token.push(escaped);
                        }
                    }
                    '"' => break,
                    c => token.push(c),
                }
            }
        } else {
            while let Some(&c) = chars.peek() {
                if c.is_whitespace() {
                    break;
                }
                token.push(c);
                chars.next();
            }
        }
        tokens.push(token);
    }
    tokens
}

fn parse_word(word: &str) -> Value {
    match word {
        "true" => json!(true),
        "false" => json!(false),
        _ => {
            if let Ok(i) = word.parse::<i64>() {
                json!(i)
            } else if let Ok(f) = word.parse::<f64>() {
                json!(f)
            } else {
                json!(word)
            }
        }
    }
}

/// Render a value the way the device does
fn encode(value: &Value) -> String {
    match value {
        Value::Null => "null".to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => match n.as_i64() {
            Some(i) => i.to_string(),
            None => format!("{:.6}", n.as_f64().unwrap_or_default()),
        },
        Value::String(s) => format!("\"{s}\""),
        Value::Array(items) => {
            let items: Vec<String> = items.iter().map(encode).collect();
            format!("[{}]", items.join(" "))
        }
        Value::Object(fields) => {
            let fields: Vec<String> = fields
                .iter()
                .map(|(k, v)| format!("\"{k}\":{}", encode(v)))
                .collect();
            format!("{{{}}}", fields.join(" "))
        }
    }
}
