//! In-memory observation store.
//!
//! Owns the probe, client, AP and denied-request tables plus the permit
//! list. All tables sit behind one mutex; critical sections never do I/O
//! and never await. Callers that need to iterate take a snapshot copy and
//! release the lock first.

use common::{ClientFlags, ClientTableMessage, MacAddr, ProbeMessage};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::time::{Duration, Instant};

/// Where an observation came from. Remote observations are never
/// re-broadcast, which is what breaks replication loops.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    Local,
    Remote,
}

#[derive(Debug, Clone)]
pub struct ProbeEntry {
    pub bssid: MacAddr,
    pub client: MacAddr,
    pub target: MacAddr,
    pub signal_dbm: i32,
    pub freq_mhz: u32,
    pub ht_capable: bool,
    pub vht_capable: bool,
    /// How often this client was heard probing at this AP. Starts at 1,
    /// only ever grows, except through the explicit setprobe path.
    pub counter: u32,
    pub origin: Origin,
    pub last_seen: Instant,
}

#[derive(Debug, Clone)]
pub struct Client {
    pub bssid: MacAddr,
    pub client: MacAddr,
    pub flags: ClientFlags,
    pub freq_mhz: u32,
    pub ht_supported: bool,
    pub vht_supported: bool,
    pub last_seen: Instant,
}

#[derive(Debug, Clone)]
pub struct Ap {
    pub bssid: MacAddr,
    pub ssid: String,
    pub freq_mhz: u32,
    pub ht: bool,
    pub vht: bool,
    pub channel_utilization: u8,
    pub station_count: u16,
    pub collision_domain: i32,
    pub bandwidth_mhz: i32,
    pub last_seen: Instant,
}

#[derive(Debug, Clone)]
pub struct DeniedRequest {
    pub bssid: MacAddr,
    pub client: MacAddr,
    pub reason: u16,
    pub last_seen: Instant,
}

/// Per-table expiry horizons, all derived from `ageing_time`.
#[derive(Debug, Clone, Copy)]
pub struct Ttls {
    pub probe: Duration,
    pub client: Duration,
    pub ap: Duration,
    pub denied: Duration,
}

impl Ttls {
    pub fn from_ageing(ageing_secs: u64) -> Self {
        Self {
            probe: Duration::from_secs(ageing_secs),
            client: Duration::from_secs(2 * ageing_secs),
            ap: Duration::from_secs(2 * ageing_secs),
            denied: Duration::from_secs(2 * ageing_secs),
        }
    }
}

#[derive(Default)]
struct Tables {
    probes: HashMap<(MacAddr, MacAddr), ProbeEntry>,
    clients: HashMap<(MacAddr, MacAddr), Client>,
    aps: BTreeMap<MacAddr, Ap>,
    denied: HashMap<(MacAddr, MacAddr), DeniedRequest>,
    permit: HashSet<MacAddr>,
}

pub struct Store {
    tables: Mutex<Tables>,
}

impl Store {
    pub fn new() -> Self {
        Self {
            tables: Mutex::new(Tables::default()),
        }
    }

    /// Insert or merge a probe observation. A repeat observation for the
    /// same `(bssid, client)` key overwrites signal, frequency and
    /// capability bits, bumps the counter and refreshes `last_seen`.
    /// Returns the merged record.
    pub fn probe_insert(&self, msg: &ProbeMessage, origin: Origin) -> ProbeEntry {
        let now = Instant::now();
        let mut tables = self.tables.lock();
        let entry = tables
            .probes
            .entry((msg.bssid, msg.address))
            .and_modify(|e| {
                e.target = msg.target;
                e.signal_dbm = msg.signal;
                e.freq_mhz = msg.freq;
                e.ht_capable = msg.ht_support;
                e.vht_capable = msg.vht_support;
                e.counter += 1;
                e.origin = origin;
                e.last_seen = now;
            })
            .or_insert_with(|| ProbeEntry {
                bssid: msg.bssid,
                client: msg.address,
                target: msg.target,
                signal_dbm: msg.signal,
                freq_mhz: msg.freq,
                ht_capable: msg.ht_support,
                vht_capable: msg.vht_support,
                counter: 1,
                origin,
                last_seen: now,
            });
        entry.clone()
    }

    pub fn probe_get(&self, bssid: MacAddr, client: MacAddr) -> Option<ProbeEntry> {
        self.tables.lock().probes.get(&(bssid, client)).cloned()
    }

    /// Set the counter of every probe row for `client` to `value`.
    /// Used by the setprobe path, which raises counters to the acceptance
    /// threshold so the next AP lets the client in.
    pub fn probe_set_all_counts(&self, client: MacAddr, value: u32) {
        let mut tables = self.tables.lock();
        for entry in tables.probes.values_mut() {
            if entry.client == client {
                entry.counter = value;
            }
        }
    }

    pub fn probe_snapshot(&self) -> Vec<ProbeEntry> {
        self.tables.lock().probes.values().cloned().collect()
    }

    /// Every probe row for one client, one per AP that heard it.
    pub fn probes_for_client(&self, client: MacAddr) -> Vec<ProbeEntry> {
        self.tables
            .lock()
            .probes
            .values()
            .filter(|p| p.client == client)
            .cloned()
            .collect()
    }

    pub fn client_insert(&self, client: Client) {
        let mut tables = self.tables.lock();
        tables.clients.insert((client.bssid, client.client), client);
    }

    pub fn client_delete(&self, bssid: MacAddr, client: MacAddr) -> Option<Client> {
        self.tables.lock().clients.remove(&(bssid, client))
    }

    pub fn client_snapshot(&self) -> Vec<Client> {
        self.tables.lock().clients.values().cloned().collect()
    }

    pub fn clients_for_ap(&self, bssid: MacAddr) -> Vec<Client> {
        self.tables
            .lock()
            .clients
            .values()
            .filter(|c| c.bssid == bssid)
            .cloned()
            .collect()
    }

    pub fn ap_insert(&self, ap: Ap) {
        self.tables.lock().aps.insert(ap.bssid, ap);
    }

    pub fn ap_get(&self, bssid: MacAddr) -> Option<Ap> {
        self.tables.lock().aps.get(&bssid).cloned()
    }

    pub fn ap_list_by_ssid(&self, ssid: &str) -> Vec<Ap> {
        self.tables
            .lock()
            .aps
            .values()
            .filter(|ap| ap.ssid == ssid)
            .cloned()
            .collect()
    }

    pub fn ap_snapshot(&self) -> Vec<Ap> {
        self.tables.lock().aps.values().cloned().collect()
    }

    pub fn denied_insert(&self, bssid: MacAddr, client: MacAddr, reason: u16) {
        let mut tables = self.tables.lock();
        // Permitted clients are never recorded as denied.
        if tables.permit.contains(&client) {
            return;
        }
        tables.denied.insert(
            (bssid, client),
            DeniedRequest {
                bssid,
                client,
                reason,
                last_seen: Instant::now(),
            },
        );
    }

    pub fn denied_lookup(&self, bssid: MacAddr, client: MacAddr) -> Option<DeniedRequest> {
        self.tables.lock().denied.get(&(bssid, client)).cloned()
    }

    /// Returns true when the address was not present before. Inserting a
    /// MAC also clears any denied records for it.
    pub fn permit_insert(&self, addr: MacAddr) -> bool {
        let mut tables = self.tables.lock();
        let inserted = tables.permit.insert(addr);
        if inserted {
            tables.denied.retain(|_, d| d.client != addr);
        }
        inserted
    }

    pub fn permit_contains(&self, addr: MacAddr) -> bool {
        self.tables.lock().permit.contains(&addr)
    }

    /// Apply one AP's client table report: refresh every listed client and
    /// the AP row itself. Returns the resulting AP record.
    pub fn apply_client_table(&self, msg: &ClientTableMessage) -> Ap {
        let now = Instant::now();
        let station_count = msg.clients.len().min(u16::MAX as usize) as u16;
        let ap = Ap {
            bssid: msg.bssid,
            ssid: msg.ssid.clone(),
            freq_mhz: msg.freq,
            ht: msg.ht_supported,
            vht: msg.vht_supported,
            channel_utilization: msg.channel_utilization.min(255) as u8,
            station_count,
            collision_domain: msg.collision_domain,
            bandwidth_mhz: msg.bandwidth,
            last_seen: now,
        };

        let mut tables = self.tables.lock();
        for (addr, flags) in &msg.clients {
            tables.clients.insert(
                (msg.bssid, *addr),
                Client {
                    bssid: msg.bssid,
                    client: *addr,
                    flags: flags.clone(),
                    freq_mhz: msg.freq,
                    ht_supported: msg.ht_supported,
                    vht_supported: msg.vht_supported,
                    last_seen: now,
                },
            );
        }
        tables.aps.insert(msg.bssid, ap.clone());
        ap
    }

    /// Drop every row older than its table's TTL. `now` is passed in so
    /// tests can run the sweep against a shifted clock.
    pub fn sweep(&self, now: Instant, ttls: &Ttls) {
        let mut tables = self.tables.lock();
        tables
            .probes
            .retain(|_, e| now.duration_since(e.last_seen) <= ttls.probe);
        tables
            .clients
            .retain(|_, e| now.duration_since(e.last_seen) <= ttls.client);
        tables
            .aps
            .retain(|_, e| now.duration_since(e.last_seen) <= ttls.ap);
        tables
            .denied
            .retain(|_, e| now.duration_since(e.last_seen) <= ttls.denied);
    }
}

impl Default for Store {
    fn default() -> Self {
        Self::new()
    }
}
