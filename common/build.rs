use tonic_build::manual::{Builder, Method, Service};

fn unary(name: &str, route: &str, input: &str, output: &str) -> Method {
    Method::builder()
        .name(name)
        .route_name(route)
        .input_type(format!("crate::rpc::{input}"))
        .output_type(format!("crate::rpc::{output}"))
        .codec_path("tonic::codec::ProstCodec")
        .build()
}

// Service stubs are generated from the prost messages in `src/rpc.rs`, so the
// build does not need `protoc` on the machine.
fn main() {
    let worker = Service::builder()
        .name("Worker")
        .package("worker")
        .method(unary("do_task", "DoTask", "DoTaskRequest", "DoTaskResponse"))
        .build();

    let coordinator = Service::builder()
        .name("Coordinator")
        .package("coordinator")
        .method(unary(
            "worker_join",
            "WorkerJoin",
            "WorkerJoinRequest",
            "WorkerJoinResponse",
        ))
        .method(unary(
            "worker_leave",
            "WorkerLeave",
            "WorkerLeaveRequest",
            "WorkerLeaveResponse",
        ))
        .build();

    Builder::new().compile(&[worker, coordinator]);
    println!("cargo:rerun-if-changed=build.rs");
}
