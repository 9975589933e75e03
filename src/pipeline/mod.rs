use crate::config::types::{Config, CHAN_SIZE, NUMBER_OF_PIPELINES};
use crate::message::PipelineMessage;
use crate::processor::Processor;
use crate::sender::{ConnectionManager, Sender};
use std::sync::Arc;
use tokio::sync::mpsc;

/// Owns the fixed bank of parallel processor→sender pipelines and hands
/// their input channels out to producers round-robin. Producers are
/// single-threaded scanners, so the iterator needs no synchronization.
pub struct PipelineProvider {
    number_of_pipelines: usize,
    pipelines_chans: Vec<mpsc::Sender<PipelineMessage>>,
    current_chan_idx: usize,
}

impl PipelineProvider {
    pub fn new() -> Self {
        Self::with_pipelines(NUMBER_OF_PIPELINES)
    }

    pub fn with_pipelines(number_of_pipelines: usize) -> Self {
        Self {
            number_of_pipelines,
            pipelines_chans: Vec::new(),
            current_chan_idx: 0,
        }
    }

    /// Spawns every pipeline: a processor feeding a sender, the senders
    /// fanning in to the auditor channel.
    pub fn start(
        &mut self,
        conn_manager: Arc<ConnectionManager>,
        auditor_chan: mpsc::Sender<PipelineMessage>,
        config: &Config,
    ) {
        for _ in 0..self.number_of_pipelines {
            let (processor_tx, processor_rx) = mpsc::channel(CHAN_SIZE);
            let (sender_tx, sender_rx) = mpsc::channel(CHAN_SIZE);

            let processor = Processor::new(
                processor_rx,
                sender_tx,
                config.api_key.clone(),
                config.logset.clone(),
                config.hostname.clone(),
            );
            tokio::spawn(processor.run());

            let sender = Sender::new(sender_rx, auditor_chan.clone(), conn_manager.clone());
            tokio::spawn(sender.run());

            self.pipelines_chans.push(processor_tx);
        }
    }

    /// The next pipeline input channel, advancing the round-robin cursor.
    pub fn next_pipeline_chan(&mut self) -> mpsc::Sender<PipelineMessage> {
        let chan = self.pipelines_chans[self.current_chan_idx].clone();
        self.current_chan_idx = (self.current_chan_idx + 1) % self.pipelines_chans.len();
        chan
    }

    /// Sweeps one `Stop` through every pipeline and drops the input sides;
    /// each stage forwards the sentinel and terminates, so the auditor sees
    /// exactly one `Stop` per pipeline.
    pub async fn stop(&mut self) {
        for chan in self.pipelines_chans.drain(..) {
            let _ = chan.send(PipelineMessage::Stop).await;
        }
        self.current_chan_idx = 0;
    }

    /// Test hook: replaces the bank with a single unstarted channel so
    /// tests can observe exactly what producers push.
    pub fn mock_pipeline_chans(&mut self) -> mpsc::Receiver<PipelineMessage> {
        let (tx, rx) = mpsc::channel(CHAN_SIZE);
        self.pipelines_chans = vec![tx];
        self.number_of_pipelines = 1;
        self.current_chan_idx = 0;
        rx
    }
}

impl Default for PipelineProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Message;

    fn make_config() -> Config {
        serde_yaml::from_str("api_key: test-key").unwrap()
    }

    #[tokio::test]
    async fn test_round_robin_chan_handout() {
        // The senders point at a closed port; nothing dials until a message
        // flows, so the bank can start without a live intake.
        let conn_manager = Arc::new(ConnectionManager::new("127.0.0.1", 1, true).unwrap());
        let (auditor_tx, _auditor_rx) = mpsc::channel(CHAN_SIZE);

        let mut provider = PipelineProvider::with_pipelines(3);
        provider.start(conn_manager, auditor_tx, &make_config());

        let first = provider.next_pipeline_chan();
        let second = provider.next_pipeline_chan();
        let third = provider.next_pipeline_chan();
        assert!(!first.same_channel(&second));
        assert!(!second.same_channel(&third));

        // The cursor wraps back to the first pipeline.
        let fourth = provider.next_pipeline_chan();
        assert!(first.same_channel(&fourth));
    }

    #[tokio::test]
    async fn test_mock_pipeline_chans() {
        let mut provider = PipelineProvider::new();
        let mut rx = provider.mock_pipeline_chans();

        let chan = provider.next_pipeline_chan();
        chan.send(PipelineMessage::Log(Message::new(b"probe".to_vec())))
            .await
            .unwrap();

        match rx.recv().await {
            Some(PipelineMessage::Log(msg)) => assert_eq!(msg.content, b"probe"),
            other => panic!("expected the probe message, got {other:?}"),
        }

        // A single mocked channel keeps handing itself out.
        assert!(provider.next_pipeline_chan().same_channel(&chan));
    }

    #[tokio::test]
    async fn test_stop_sweeps_every_pipeline() {
        let conn_manager = Arc::new(ConnectionManager::new("127.0.0.1", 1, true).unwrap());
        let (auditor_tx, mut auditor_rx) = mpsc::channel(CHAN_SIZE);

        let mut provider = PipelineProvider::with_pipelines(2);
        provider.start(conn_manager, auditor_tx, &make_config());
        provider.stop().await;

        // One Stop per pipeline fans in to the auditor channel.
        assert!(matches!(auditor_rx.recv().await, Some(PipelineMessage::Stop)));
        assert!(matches!(auditor_rx.recv().await, Some(PipelineMessage::Stop)));
    }
}
