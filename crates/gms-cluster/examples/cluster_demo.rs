//! Group membership demonstration
//!
//! Starts three members on UDP loopback sockets, lets them form a cluster,
//! removes one and has another leave gracefully.

use gms_cluster::{MembershipConfig, MembershipEvent, MembershipService};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::time::sleep;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::fmt::init();

    println!("🚀 Starting group membership demo");

    let locator: SocketAddr = "127.0.0.1:8001".parse()?;
    let node1 = MembershipService::bind_udp(create_node_config("node-1", "127.0.0.1:8001", true, vec![])?).await?;
    let mut events = node1.events();
    node1.start().await?;

    let node2 =
        MembershipService::bind_udp(create_node_config("node-2", "127.0.0.1:8002", false, vec![locator])?).await?;
    node2.start().await?;

    let node3 =
        MembershipService::bind_udp(create_node_config("node-3", "127.0.0.1:8003", false, vec![locator])?).await?;
    node3.start().await?;

    for node in [&node1, &node2, &node3] {
        if let Some(view) = node.current_view() {
            println!("✅ {} sees {}", node.local_member(), view);
        }
    }

    println!("\n🧹 Removing node-3...");
    node2.request_removal(node3.local_member(), "demo removal").await?;
    sleep(Duration::from_secs(1)).await;
    println!("   node-3 status: {:?}", node3.status());

    println!("\n👋 node-2 leaving...");
    node2.leave().await?;
    sleep(Duration::from_millis(500)).await;

    if let Some(view) = node1.current_view() {
        println!("✅ node-1 now sees {}", view);
    }

    println!("\n📜 Events observed by node-1:");
    while let Ok(event) = events.try_recv() {
        match event {
            MembershipEvent::ViewInstalled { view_number, members, .. } => {
                println!("   view {} installed with {} members", view_number, members)
            }
            other => println!("   {}", serde_json::to_string(&other)?),
        }
    }

    node3.shutdown().await?;
    node1.leave().await?;

    println!("\n🎉 Demo completed");
    Ok(())
}

fn create_node_config(
    name: &str,
    bind: &str,
    is_initial: bool,
    locators: Vec<SocketAddr>,
) -> Result<MembershipConfig, Box<dyn std::error::Error>> {
    Ok(MembershipConfig {
        member_name: name.to_string(),
        cluster_name: "demo-cluster".to_string(),
        bind_address: bind.parse()?,
        is_initial_member: is_initial,
        locators,
        heartbeat_interval: Duration::from_millis(250),
        join_timeout: Duration::from_secs(10),
        ..Default::default()
    })
}
