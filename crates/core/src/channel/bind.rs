use std::sync::Arc;

use super::{ChannelResult, Message, MultiChannel, Underlay};

/// A step of the bind-handler chain, invoked exactly once while an underlay is being
/// attached to a channel. Returning an error aborts the bind of that underlay.
pub trait BindHandler: Send + Sync {
    fn bind_channel(&self, binding: &mut Binding<'_>) -> ChannelResult<()>;
}

/// Invoked exactly once when a bound member underlay goes away.
pub trait CloseHandler: Send + Sync {
    fn handle_close(&self, channel: &MultiChannel, underlay: &Arc<dyn Underlay>);
}

/// Handles inbound messages of a given content type.
pub trait ReceiveHandler: Send + Sync {
    fn handle_receive(&self, msg: Message, channel: &MultiChannel);
}

pub struct BindHandlerFn<F>(pub F);

impl<F> BindHandler for BindHandlerFn<F>
where
    F: Fn(&mut Binding<'_>) -> ChannelResult<()> + Send + Sync,
{
    fn bind_channel(&self, binding: &mut Binding<'_>) -> ChannelResult<()> {
        (self.0)(binding)
    }
}

pub struct CloseHandlerFn<F>(pub F);

impl<F> CloseHandler for CloseHandlerFn<F>
where
    F: Fn(&MultiChannel, &Arc<dyn Underlay>) + Send + Sync,
{
    fn handle_close(&self, channel: &MultiChannel, underlay: &Arc<dyn Underlay>) {
        (self.0)(channel, underlay)
    }
}

pub struct ReceiveHandlerFn<F>(pub F);

impl<F> ReceiveHandler for ReceiveHandlerFn<F>
where
    F: Fn(Message, &MultiChannel) + Send + Sync,
{
    fn handle_receive(&self, msg: Message, channel: &MultiChannel) {
        (self.0)(msg, channel)
    }
}

/// Ordered composition of bind handlers. Handlers run in insertion order and the
/// chain stops at the first failure.
#[derive(Default, Clone)]
pub struct BindHandlers {
    handlers: Vec<Arc<dyn BindHandler>>,
}

impl BindHandlers {
    pub fn new(handlers: Vec<Arc<dyn BindHandler>>) -> Self {
        Self { handlers }
    }

    pub fn push(&mut self, handler: Arc<dyn BindHandler>) {
        self.handlers.push(handler);
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl BindHandler for BindHandlers {
    fn bind_channel(&self, binding: &mut Binding<'_>) -> ChannelResult<()> {
        for handler in &self.handlers {
            handler.bind_channel(binding)?;
        }
        Ok(())
    }
}

/// The in-progress attachment of one underlay to a channel.
///
/// Handlers registered here only take effect once the whole chain succeeded.
pub struct Binding<'a> {
    channel: &'a Arc<MultiChannel>,
    underlay: Arc<dyn Underlay>,
    pub(super) close_handlers: Vec<Arc<dyn CloseHandler>>,
    pub(super) receive_handlers: Vec<(u32, Arc<dyn ReceiveHandler>)>,
}

impl<'a> Binding<'a> {
    pub(super) fn new(channel: &'a Arc<MultiChannel>, underlay: Arc<dyn Underlay>) -> Self {
        Self {
            channel,
            underlay,
            close_handlers: Vec::new(),
            receive_handlers: Vec::new(),
        }
    }

    pub fn channel(&self) -> &Arc<MultiChannel> {
        self.channel
    }

    pub fn underlay(&self) -> &Arc<dyn Underlay> {
        &self.underlay
    }

    pub fn add_close_handler(&mut self, handler: impl CloseHandler + 'static) {
        self.close_handlers.push(Arc::new(handler));
    }

    pub fn add_receive_handler(&mut self, content_type: u32, handler: impl ReceiveHandler + 'static) {
        self.receive_handlers.push((content_type, Arc::new(handler)));
    }
}
