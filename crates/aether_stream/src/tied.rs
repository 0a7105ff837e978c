use {
    crate::{DynGate, Gate, LinkOut, StreamInfo, WriteView},
    aether_action::EventSubscriber,
    alloc::rc::Rc,
    web_time::Instant,
};

/// Two linked stages acting as one.
///
/// Writes go into `L`, which is linked to `R`. The pair is itself a [`Gate`]
/// with `L`'s upper end, and a [`LinkOut`] with `R`'s lower end, so pairs can
/// be nested to build pipelines of any length; see [`tied_stream!`].
///
/// [`tied_stream!`]: crate::tied_stream
#[derive(Debug)]
pub struct TiedStream<L, R> {
    left: Rc<L>,
    right: Rc<R>,
}

impl<L, R> TiedStream<L, R>
where
    L: LinkOut,
    R: Gate<In = L::WriteIn, Out = L::ReadOut>,
{
    /// Links `left` to `right` and owns both.
    pub fn new(left: Rc<L>, right: Rc<R>) -> Self {
        let out: DynGate<L::WriteIn, L::ReadOut> = right.clone();
        left.link_out(out);
        Self { left, right }
    }
}

impl<L, R> TiedStream<L, R> {
    /// Gets the upper stage.
    #[must_use]
    pub const fn left(&self) -> &Rc<L> {
        &self.left
    }

    /// Gets the lower stage.
    #[must_use]
    pub const fn right(&self) -> &Rc<R> {
        &self.right
    }
}

impl<L: Gate, R: 'static> Gate for TiedStream<L, R> {
    type In = L::In;
    type Out = L::Out;

    fn write_in(&self, data: Self::In, now: Instant) -> WriteView {
        self.left.write_in(data, now)
    }

    fn out_data_event(&self) -> EventSubscriber<Self::Out> {
        self.left.out_data_event()
    }

    fn gate_update_event(&self) -> EventSubscriber<()> {
        self.left.gate_update_event()
    }

    fn stream_info(&self) -> StreamInfo {
        self.left.stream_info()
    }
}

impl<L, R: LinkOut> LinkOut for TiedStream<L, R> {
    type WriteIn = R::WriteIn;
    type ReadOut = R::ReadOut;

    fn link_out(&self, out: DynGate<Self::WriteIn, Self::ReadOut>) {
        self.right.link_out(out);
    }
}

/// Builds nested [`TiedStream`]s out of a chain of stages.
///
/// `tied_stream!(a, b, c)` is `TiedStream::new(a, Rc::new(TiedStream::new(b,
/// c)))`. Every argument is an [`Rc`] to a stage.
///
/// [`TiedStream`]: crate::TiedStream
/// [`Rc`]: alloc::rc::Rc
#[macro_export]
macro_rules! tied_stream {
    ($left:expr, $right:expr $(,)?) => {
        $crate::TiedStream::new($left, $right)
    };
    ($left:expr, $($rest:expr),+ $(,)?) => {
        $crate::TiedStream::new(
            $left,
            $crate::__private::Rc::new($crate::tied_stream!($($rest),+)),
        )
    };
}
