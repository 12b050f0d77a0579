use std::{
    convert::Infallible,
    future::Future,
    net,
    sync::{
        atomic::{AtomicUsize, Ordering},
        mpsc as std_mpsc, Arc,
    },
    thread,
    time::Duration,
};

use hyper::service::{make_service_fn, service_fn};
use tokio::{runtime, sync::oneshot};

pub struct Server {
    addr: net::SocketAddr,
    connections: Arc<AtomicUsize>,
    panic_rx: std_mpsc::Receiver<()>,
    shutdown_tx: Option<oneshot::Sender<()>>,
}

impl Server {
    pub fn addr(&self) -> net::SocketAddr {
        self.addr
    }

    /// How many TCP connections the server has accepted so far.
    #[allow(unused)]
    pub fn connections(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }

        if !::std::thread::panicking() {
            self.panic_rx
                .recv_timeout(Duration::from_secs(3))
                .expect("test server should not panic");
        }
    }
}

pub fn http<F, Fut>(func: F) -> Server
where
    F: Fn(http::Request<hyper::Body>) -> Fut + Clone + Send + 'static,
    Fut: Future<Output = http::Response<hyper::Body>> + Send + 'static,
{
    // Spawn a dedicated runtime in a thread to avoid reactor context
    // conflicts with the test's own runtime.
    let test_name = thread::current().name().unwrap_or("<unknown>").to_string();

    let (addr_tx, addr_rx) = std_mpsc::channel();
    let (panic_tx, panic_rx) = std_mpsc::channel();
    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
    let connections = Arc::new(AtomicUsize::new(0));
    let conn_counter = connections.clone();

    thread::Builder::new()
        .name(format!("test({test_name})-support-server"))
        .spawn(move || {
            let rt = runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .expect("new rt");
            rt.block_on(async move {
                let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
                listener.set_nonblocking(true).unwrap();
                let addr = listener.local_addr().unwrap();

                let make_service = make_service_fn(move |_conn| {
                    conn_counter.fetch_add(1, Ordering::SeqCst);
                    let func = func.clone();
                    async move {
                        Ok::<_, Infallible>(service_fn(move |req| {
                            let fut = func(req);
                            async move { Ok::<_, Infallible>(fut.await) }
                        }))
                    }
                });

                let server = hyper::Server::from_tcp(listener)
                    .unwrap()
                    .serve(make_service)
                    .with_graceful_shutdown(async move {
                        let _ = shutdown_rx.await;
                    });

                addr_tx.send(addr).unwrap();
                server.await.unwrap();
                let _ = panic_tx.send(());
            });
        })
        .expect("support server thread");

    Server {
        addr: addr_rx.recv().expect("server addr"),
        connections,
        panic_rx,
        shutdown_tx: Some(shutdown_tx),
    }
}
