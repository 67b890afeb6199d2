use std::time::Duration;

use crate::client::ApiClient;
use crate::commands::inspect::{format_event, outcome_line};

pub async fn deploy(client: &ApiClient, source: &str, actor: &str, wait: bool, poll: Duration) -> anyhow::Result<i32> {
    let id = client.deploy(source, actor).await?;
    println!("queued {id}: deploy {source}");
    if !wait {
        return Ok(0);
    }
    follow(client, &id, poll).await
}

pub async fn rollback(client: &ApiClient, target: &str, actor: &str, wait: bool, poll: Duration) -> anyhow::Result<i32> {
    let id = client.rollback(target, actor).await?;
    println!("queued {id}: rollback to {target}");
    if !wait {
        return Ok(0);
    }
    follow(client, &id, poll).await
}

/// Print events as they arrive until the deployment is terminal; returns
/// its exit code.
async fn follow(client: &ApiClient, id: &str, poll: Duration) -> anyhow::Result<i32> {
    let mut seen = 0;
    loop {
        // Read the record first so no event before the terminal state is missed.
        let view = client.deployment(id).await?;
        for event in client.events_for(id).await? {
            if event.seq <= seen {
                continue;
            }
            println!("{}", format_event(&event));
            seen = event.seq;
        }
        if let Some(code) = view.exit_code {
            println!("{}", outcome_line(&view));
            return Ok(code);
        }
        tokio::time::sleep(poll).await;
    }
}
