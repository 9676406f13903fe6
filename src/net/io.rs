//! Async socket calls
//!
//! Futures over a stack shared as `spin::Mutex<NetStack<D>>`. Each one
//! retries the underlying call whenever the stack wakes it, either because
//! the handle became ready or because its deadline passed. The lock is never
//! held across an await point.

use core::net::SocketAddrV4;
use core::task::Poll;
use futures_util::future::poll_fn;
use spin::Mutex;

use crate::drivers::net::NetworkDevice;
use crate::net::error::SocketError;
use crate::net::socket::{Completion, Received, SocketHandle, WaitToken};
use crate::net::stack::NetStack;
use crate::net::udp::Datagram;

/// Resolve once `token`'s condition holds
pub async fn wait_for<D: NetworkDevice>(
    stack: &Mutex<NetStack<D>>,
    token: WaitToken,
) -> Result<(), SocketError> {
    poll_fn(|cx| {
        let mut stack = stack.lock();
        match stack.wait(&token) {
            Ok(Completion::Ready(())) => Poll::Ready(Ok(())),
            Ok(Completion::Suspend(token)) => {
                stack.register_waker(&token, cx.waker());
                Poll::Pending
            }
            Err(err) => Poll::Ready(Err(err)),
        }
    })
    .await
}

/// Open a connection and wait for the handshake
///
/// A connection that fails or times out is closed before the error is
/// returned.
pub async fn connect<D: NetworkDevice>(
    stack: &Mutex<NetStack<D>>,
    remote: SocketAddrV4,
) -> Result<SocketHandle, SocketError> {
    let completion = stack.lock().connect(remote)?;
    let token = match completion {
        Completion::Ready(handle) => return Ok(handle),
        Completion::Suspend(token) => token,
    };

    if let Err(err) = wait_for(stack, token).await {
        let _ = stack.lock().close(token.handle);
        return Err(err);
    }
    Ok(token.handle)
}

pub async fn accept<D: NetworkDevice>(
    stack: &Mutex<NetStack<D>>,
    listener: SocketHandle,
) -> Result<SocketHandle, SocketError> {
    loop {
        let completion = stack.lock().accept(listener)?;
        match completion {
            Completion::Ready(handle) => return Ok(handle),
            Completion::Suspend(token) => wait_for(stack, token).await?,
        }
    }
}

pub async fn recv<D: NetworkDevice>(
    stack: &Mutex<NetStack<D>>,
    handle: SocketHandle,
    max_len: usize,
) -> Result<Received, SocketError> {
    loop {
        let completion = stack.lock().recv(handle, max_len)?;
        match completion {
            Completion::Ready(received) => return Ok(received),
            Completion::Suspend(token) => wait_for(stack, token).await?,
        }
    }
}

pub async fn recv_from<D: NetworkDevice>(
    stack: &Mutex<NetStack<D>>,
    handle: SocketHandle,
) -> Result<Datagram, SocketError> {
    loop {
        let completion = stack.lock().recv_from(handle)?;
        match completion {
            Completion::Ready(datagram) => return Ok(datagram),
            Completion::Suspend(token) => wait_for(stack, token).await?,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::sync::Arc;
    use core::future::Future;
    use core::net::Ipv4Addr;
    use core::pin::pin;
    use core::sync::atomic::{AtomicBool, Ordering};
    use core::task::Context;
    use core::time::Duration;
    use futures_util::task::{ArcWake, waker};

    use crate::net::config::{NetworkConfig, StackConfig};
    use crate::net::ethernet::MacAddress;
    use crate::net::loopback::LoopbackDevice;

    #[derive(Default)]
    struct Flag(AtomicBool);

    impl ArcWake for Flag {
        fn wake_by_ref(arc_self: &Arc<Self>) {
            arc_self.0.store(true, Ordering::SeqCst);
        }
    }

    fn stack(device: LoopbackDevice, last_octet: u8) -> Mutex<NetStack<LoopbackDevice>> {
        let network = NetworkConfig::new(
            Ipv4Addr::new(10, 0, 0, last_octet),
            Ipv4Addr::new(255, 255, 255, 0),
            None,
        );
        let config = StackConfig::new(network).with_socket_timeout(Some(Duration::from_millis(50)));
        let mut stack = NetStack::new(device, config);
        stack.bring_up().unwrap();
        Mutex::new(stack)
    }

    fn pump(a: &Mutex<NetStack<LoopbackDevice>>, b: &Mutex<NetStack<LoopbackDevice>>) {
        while a.lock().poll() + b.lock().poll() > 0 {}
    }

    #[test]
    fn test_accept_wakes_on_handshake() {
        let (dev_a, dev_b) = LoopbackDevice::pair(
            MacAddress([2, 0, 0, 0, 0, 1]),
            MacAddress([2, 0, 0, 0, 0, 2]),
            64,
        );
        let server = stack(dev_a, 1);
        let client = stack(dev_b, 2);
        let listener = server.lock().listen(80, 4).unwrap();

        let flag = Arc::new(Flag::default());
        let waker = waker(flag.clone());
        let mut cx = Context::from_waker(&waker);
        let mut accepting = pin!(accept(&server, listener));
        assert!(accepting.as_mut().poll(&mut cx).is_pending());

        let connecting = client
            .lock()
            .connect(SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 1), 80))
            .unwrap();
        assert!(!connecting.is_ready());
        pump(&server, &client);

        assert!(flag.0.load(Ordering::SeqCst));
        match accepting.as_mut().poll(&mut cx) {
            Poll::Ready(Ok(SocketHandle::Tcp(_))) => {}
            other => panic!("accept did not complete: {:?}", other),
        }
    }

    #[test]
    fn test_recv_times_out() {
        let lo = LoopbackDevice::new(MacAddress([2, 0, 0, 0, 0, 1]), 64);
        let shared = stack(lo, 1);
        let socket = shared.lock().udp_bind(5353).unwrap();

        let flag = Arc::new(Flag::default());
        let waker = waker(flag.clone());
        let mut cx = Context::from_waker(&waker);
        let mut receiving = pin!(recv_from(&shared, socket));
        assert!(receiving.as_mut().poll(&mut cx).is_pending());

        for _ in 0..5 {
            shared.lock().tick();
        }
        assert!(flag.0.load(Ordering::SeqCst));
        assert!(matches!(
            receiving.as_mut().poll(&mut cx),
            Poll::Ready(Err(SocketError::TimedOut))
        ));
    }
}
