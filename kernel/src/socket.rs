//! Socket layer backing the `socket`/`bind`/`connect`/`send` syscalls. The
//! concrete protocol set is small and fixed (block devices: virtio-blk;
//! sockets: UDP), so this mirrors `blk.rs`'s fixed-size-class dispatch table
//! rather than reaching for a trait object. There is no network transport
//! wired up below this layer, so a UDP socket's `send` has nowhere to hand
//! its datagram off to; it validates and accounts for the send the way the
//! real path would and stops there.

use array_macro::array;
use arrayvec::ArrayVec;

use crate::error::{KernelError, KResult};
use crate::lock::IrqLock;
use crate::param::{NPROC_SOCKETS, NSOCKET};
use crate::proc::ProcIdx;

/// Index into the socket arena, stored in a process's open-socket list.
pub type SocketId = usize;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum SocketState {
    Unbound,
    Bound,
    Connected,
}

/// The one protocol this kernel's socket syscalls speak. A second protocol
/// would add a sibling `enum` variant here rather than a new trait object,
/// since the set is closed and small.
struct UdpSocket {
    owner: ProcIdx,
    state: SocketState,
    local_port: u16,
    remote_addr: u32,
    remote_port: u16,
    sent_datagrams: u32,
}

static SOCKETS: IrqLock<[Option<UdpSocket>; NSOCKET]> =
    IrqLock::new("sockets", array![_ => None; NSOCKET]);

/// Ephemeral local-port cursor; wraps within the high range conventionally
/// reserved for ephemeral ports. Single-CPU, so a plain counter under the
/// same lock as the table needs no further synchronization.
static NEXT_EPHEMERAL: IrqLock<u16> = IrqLock::new("next_ephemeral_port", 49152);

fn alloc_ephemeral_port(guard: &mut [Option<UdpSocket>; NSOCKET]) -> u16 {
    let mut cursor = NEXT_EPHEMERAL.lock();
    loop {
        let candidate = *cursor;
        *cursor = if candidate == u16::MAX { 49152 } else { candidate + 1 };
        let in_use = guard
            .iter()
            .flatten()
            .any(|s| s.state != SocketState::Unbound && s.local_port == candidate);
        if !in_use {
            return candidate;
        }
    }
}

/// Creates a new unbound UDP socket owned by `owner`, returning its id. The
/// caller (the `socket` syscall handler) is responsible for pushing the
/// returned id onto the owning process's open-socket list.
pub fn socket_create(owner: ProcIdx) -> KResult<SocketId> {
    let mut guard = SOCKETS.lock();
    let slot = guard.iter().position(|s| s.is_none()).ok_or(KernelError::OutOfMemory)?;
    guard[slot] = Some(UdpSocket {
        owner,
        state: SocketState::Unbound,
        local_port: 0,
        remote_addr: 0,
        remote_port: 0,
        sent_datagrams: 0,
    });
    Ok(slot)
}

/// Binds `id` to `port`, or to a fresh ephemeral port if `port == 0`. Fails
/// if the socket does not belong to `owner` or the port is already taken.
pub fn socket_bind(owner: ProcIdx, id: SocketId, port: u16) -> KResult<()> {
    let mut guard = SOCKETS.lock();
    let port = if port == 0 { alloc_ephemeral_port(&mut guard) } else { port };
    let taken = guard
        .iter()
        .flatten()
        .any(|s| s.state != SocketState::Unbound && s.local_port == port);
    if taken {
        return Err(KernelError::AddressInUse);
    }
    let sock = guard
        .get_mut(id)
        .and_then(|s| s.as_mut())
        .filter(|s| s.owner == owner)
        .ok_or(KernelError::BadFileDescriptor)?;
    sock.local_port = port;
    sock.state = SocketState::Bound;
    Ok(())
}

/// Associates `id` with a remote `(addr, port)`, implicitly binding it to an
/// ephemeral local port first if it is still unbound (standard UDP
/// `connect` semantics: it only fixes the destination, it does not dial).
pub fn socket_connect(owner: ProcIdx, id: SocketId, addr: u32, port: u16) -> KResult<()> {
    {
        let mut guard = SOCKETS.lock();
        let needs_bind = matches!(
            guard.get(id).and_then(|s| s.as_ref()).map(|s| s.state),
            Some(SocketState::Unbound)
        );
        if needs_bind {
            let ephemeral = alloc_ephemeral_port(&mut guard);
            let sock = guard
                .get_mut(id)
                .and_then(|s| s.as_mut())
                .filter(|s| s.owner == owner)
                .ok_or(KernelError::BadFileDescriptor)?;
            sock.local_port = ephemeral;
        }
    }
    let mut guard = SOCKETS.lock();
    let sock = guard
        .get_mut(id)
        .and_then(|s| s.as_mut())
        .filter(|s| s.owner == owner)
        .ok_or(KernelError::BadFileDescriptor)?;
    sock.remote_addr = addr;
    sock.remote_port = port;
    sock.state = SocketState::Connected;
    Ok(())
}

/// Sends `buf` as one datagram to `id`'s connected peer. With no network
/// transport wired up, this validates state and length, accounts for the
/// send, and returns -- the send path a real driver would extend by handing
/// the datagram to a NIC here instead of returning.
pub fn socket_send(owner: ProcIdx, id: SocketId, buf: &[u8]) -> KResult<usize> {
    if buf.len() > u16::MAX as usize {
        return Err(KernelError::InvalidArgument);
    }
    let mut guard = SOCKETS.lock();
    let sock = guard
        .get_mut(id)
        .and_then(|s| s.as_mut())
        .filter(|s| s.owner == owner)
        .ok_or(KernelError::BadFileDescriptor)?;
    if sock.state != SocketState::Connected {
        return Err(KernelError::AddressNotAvailable);
    }
    sock.sent_datagrams += 1;
    crate::kinfo!(
        "socket: {} -> {:#x}:{} ({} bytes, #{})",
        sock.local_port,
        sock.remote_addr,
        sock.remote_port,
        buf.len(),
        sock.sent_datagrams
    );
    Ok(buf.len())
}

/// Releases every socket in `ids` (a process's drained open-socket list on
/// exit). Unknown ids are a logic error elsewhere, not a fault here -- a
/// retiring process's own list can only name sockets it created.
pub fn socket_close_all(ids: &mut ArrayVec<SocketId, NPROC_SOCKETS>) {
    let mut guard = SOCKETS.lock();
    for id in ids.drain(..) {
        guard[id] = None;
    }
}
