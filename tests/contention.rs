//! Contention-window and integrity scenarios that need a hand on the
//! transport: a split with handed-over requests, and CRC-driven read
//! retries.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Barrier, Mutex};
use std::time::Duration;

use distore::data::{NodeType, PAIRS_OFFSET};
use distore::memory::remote::{MemoryNodeHandle, RemoteMemory};
use distore::memory_node::{DirectRpc, MemoryNodeAllocator};
use distore::transport::{Endpoint, LoopbackTransport, MemoryPool, Transport, WriteRequest};
use distore::workload::decimal_key;
use distore::{ComputeNode, PAGE_SIZE, SEGMENT_SIZE};

/// Arms a one-shot action on the next read of a given remote address.
struct ReadTrap {
    target: Mutex<Option<u64>>,
    fired: AtomicBool,
    delay: Option<Duration>,
    corrupt: bool,
}

impl ReadTrap {
    fn delaying(d: Duration) -> Arc<ReadTrap> {
        Arc::new(ReadTrap {
            target: Mutex::new(None),
            fired: AtomicBool::new(false),
            delay: Some(d),
            corrupt: false,
        })
    }

    fn corrupting() -> Arc<ReadTrap> {
        Arc::new(ReadTrap {
            target: Mutex::new(None),
            fired: AtomicBool::new(false),
            delay: None,
            corrupt: true,
        })
    }

    fn arm(&self, addr: u64) {
        self.fired.store(false, Ordering::SeqCst);
        *self.target.lock().unwrap() = Some(addr);
    }

    fn take(&self, addr: u64) -> bool {
        let mut t = self.target.lock().unwrap();
        if *t == Some(addr) {
            *t = None;
            self.fired.store(true, Ordering::SeqCst);
            true
        } else {
            false
        }
    }
}

struct TrappedTransport {
    inner: Arc<LoopbackTransport>,
    trap: Arc<ReadTrap>,
}

impl Transport for TrappedTransport {
    fn open_endpoint(
        &self,
        node: u8,
    ) -> Result<Box<dyn Endpoint>, distore::TransportError> {
        Ok(Box::new(TrappedEndpoint {
            inner: self.inner.open_endpoint(node)?,
            trap: self.trap.clone(),
        }))
    }
}

struct TrappedEndpoint {
    inner: Box<dyn Endpoint>,
    trap: Arc<ReadTrap>,
}

impl Endpoint for TrappedEndpoint {
    fn post_read(&mut self, addr: u64, into: &mut [u8]) -> Result<(), distore::TransportError> {
        let hit = self.trap.take(addr);
        if hit {
            if let Some(d) = self.trap.delay {
                std::thread::sleep(d);
            }
        }
        self.inner.post_read(addr, into)?;
        if hit && self.trap.corrupt {
            // flip one byte inside the pair area, past the header
            into[PAIRS_OFFSET + 21] ^= 0x5a;
        }
        Ok(())
    }

    fn post_write(&mut self, addr: u64, data: &[u8]) -> Result<(), distore::TransportError> {
        self.inner.post_write(addr, data)
    }

    fn post_write_batch(
        &mut self,
        writes: &[WriteRequest<'_>],
    ) -> Result<(), distore::TransportError> {
        self.inner.post_write_batch(writes)
    }
}

fn trapped_store(trap: Arc<ReadTrap>) -> Arc<ComputeNode> {
    let cap = SEGMENT_SIZE + PAGE_SIZE;
    let alloc = Arc::new(MemoryNodeAllocator::new(0, cap));
    let handles = vec![MemoryNodeHandle {
        node_id: 0,
        base_addr: alloc.base_addr(),
        rpc_id: 0,
        info: None,
    }];
    let inner = LoopbackTransport::new(vec![MemoryPool::new(0, cap)]);
    let transport = Arc::new(TrappedTransport { inner, trap });
    let rpc = DirectRpc::new(vec![alloc]);
    ComputeNode::bootstrap(RemoteMemory::new(handles, transport, Box::new(rpc)))
}

/// Grow one record to a full type 16 under anchor 101 and return its
/// remote address. Leaves keys 100..=116 in the store.
fn fill_one_sixteen(node: &Arc<ComputeNode>, client: &mut distore::Client) -> u64 {
    for i in 100..=116u64 {
        client.put(&decimal_key(i), &decimal_key(i)).unwrap();
    }
    let (ptr, t) = node.search_layer().search(&decimal_key(101)).unwrap();
    assert_eq!(t, NodeType::Type16);
    let rec = client.fetch_record(ptr).unwrap();
    assert_eq!(rec.next(), 16);
    ptr.address()
}

#[test]
fn split_sixteen_with_two_handed_over_requests() {
    let trap = ReadTrap::delaying(Duration::from_millis(50));
    let node = trapped_store(trap.clone());
    let mut client = node.register_thread().unwrap();

    let target_addr = fill_one_sixteen(&node, &mut client);

    // three threads race three fresh keys; the winner's fetch stalls in
    // the trap, so both losers join the handover window
    trap.arm(target_addr);
    let barrier = Barrier::new(3);
    std::thread::scope(|scope| {
        for i in 117..=119u64 {
            let node = node.clone();
            let barrier = &barrier;
            scope.spawn(move || {
                let mut c = node.register_thread().unwrap();
                barrier.wait();
                assert!(c.put(&decimal_key(i), &decimal_key(i)).unwrap());
            });
        }
    });
    assert!(trap.fired.load(Ordering::SeqCst));
    node.quiesce_calibration();

    // 19 keys split nine/ten across two type-10 records; the right anchor
    // is the tenth smallest
    let (lp, lt) = node.search_layer().search(&decimal_key(101)).unwrap();
    let (rp, rt) = node
        .search_layer()
        .search(&decimal_key(110))
        .expect("right anchor 110 missing from the search layer");
    assert_eq!(lt, NodeType::Type10);
    assert_eq!(rt, NodeType::Type10);
    let left = client.fetch_record(lp).unwrap();
    let right = client.fetch_record(rp).unwrap();
    assert_eq!(left.next(), 9);
    assert_eq!(right.next(), 10);

    for i in 100..=119u64 {
        assert_eq!(client.get(&decimal_key(i)).unwrap(), Some(decimal_key(i)));
    }
}

#[test]
fn crc_mismatch_retries_the_read() {
    let trap = ReadTrap::corrupting();
    let node = trapped_store(trap.clone());
    let mut client = node.register_thread().unwrap();

    for i in 1..=30u64 {
        client.put(&decimal_key(i), &decimal_key(i)).unwrap();
    }

    let snode = node.search_layer().fuzzy_search(&decimal_key(5));
    assert!(!snode.is_head());
    trap.arm(snode.data_node().address());

    // the first fetch comes back torn; the reader must retry and land on
    // the intact image
    assert_eq!(client.get(&decimal_key(5)).unwrap(), Some(decimal_key(5)));
    assert!(trap.fired.load(Ordering::SeqCst));
}
