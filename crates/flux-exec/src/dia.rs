//! The typed surface: [`Dia<T>`] and the LOps (§4.9: Map, Filter, FlatMap)
//! that fold into a parent's function stack instead of creating a new graph
//! node. `RegisterChild` (§4.8) is [`DataSource::register_child`]; each LOp
//! just wraps the previous `DataSource` in an adapter that composes its
//! closure with the registered callback, so by the time a real DOp/Action
//! registers on the chain, every Map/Filter/FlatMap between it and the last
//! real node has been fused into one callback — option (a) of the two
//! function-stack strategies in the design notes, specialized per chain via
//! monomorphization rather than a boxed per-stage trait object.

use std::rc::Rc;

use flux_core::Result;

use crate::node::ExecNode;

/// What a node in the (typed) function-stack sense exposes to its children:
/// the underlying graph node (for the stage builder) and the ability to
/// register a push callback that receives this `DataSource`'s items during
/// its node's `PushData`.
pub trait DataSource<T> {
    fn node(&self) -> Rc<dyn ExecNode>;
    fn register_child(&self, callback: Box<dyn FnMut(T) -> Result<()>>);
}

/// A typed handle onto one point in the dataflow graph.
pub struct Dia<T> {
    source: Rc<dyn DataSource<T>>,
}

impl<T> Clone for Dia<T> {
    fn clone(&self) -> Self {
        Dia { source: self.source.clone() }
    }
}

impl<T: 'static> Dia<T> {
    pub fn from_source(source: Rc<dyn DataSource<T>>) -> Self {
        Dia { source }
    }

    pub fn node(&self) -> Rc<dyn ExecNode> {
        self.source.node()
    }

    pub fn register_child(&self, callback: Box<dyn FnMut(T) -> Result<()>>) {
        self.source.register_child(callback)
    }

    /// §4.9 LOp: element-wise transform, fused into the function stack.
    pub fn map<U: 'static>(&self, f: impl Fn(T) -> U + 'static) -> Dia<U> {
        Dia::from_source(Rc::new(MappedSource {
            inner: self.source.clone(),
            f: Rc::new(f),
            _marker: std::marker::PhantomData,
        }))
    }

    /// §4.9 LOp: element-wise predicate, fused into the function stack.
    pub fn filter(&self, pred: impl Fn(&T) -> bool + 'static) -> Dia<T> {
        Dia::from_source(Rc::new(FilteredSource { inner: self.source.clone(), pred: Rc::new(pred) }))
    }

    /// §4.9 LOp: element-wise 0..N expansion, fused into the function stack.
    pub fn flat_map<U: 'static, I: IntoIterator<Item = U>>(&self, f: impl Fn(T) -> I + 'static) -> Dia<U> {
        Dia::from_source(Rc::new(FlatMappedSource {
            inner: self.source.clone(),
            f: Rc::new(f),
            _marker: std::marker::PhantomData,
        }))
    }
}

struct MappedSource<T, U, F> {
    inner: Rc<dyn DataSource<T>>,
    f: Rc<F>,
    _marker: std::marker::PhantomData<fn(T) -> U>,
}

impl<T: 'static, U: 'static, F: Fn(T) -> U + 'static> DataSource<U> for MappedSource<T, U, F> {
    fn node(&self) -> Rc<dyn ExecNode> {
        self.inner.node()
    }

    fn register_child(&self, mut callback: Box<dyn FnMut(U) -> Result<()>>) {
        let f = self.f.clone();
        self.inner.register_child(Box::new(move |t: T| callback((f)(t))));
    }
}

struct FilteredSource<T, P> {
    inner: Rc<dyn DataSource<T>>,
    pred: Rc<P>,
}

impl<T: 'static, P: Fn(&T) -> bool + 'static> DataSource<T> for FilteredSource<T, P> {
    fn node(&self) -> Rc<dyn ExecNode> {
        self.inner.node()
    }

    fn register_child(&self, mut callback: Box<dyn FnMut(T) -> Result<()>>) {
        let pred = self.pred.clone();
        self.inner.register_child(Box::new(move |t: T| {
            if (pred)(&t) {
                callback(t)
            } else {
                Ok(())
            }
        }));
    }
}

struct FlatMappedSource<T, U, I, F> {
    inner: Rc<dyn DataSource<T>>,
    f: Rc<F>,
    _marker: std::marker::PhantomData<fn(T) -> (U, I)>,
}

impl<T: 'static, U: 'static, I: IntoIterator<Item = U>, F: Fn(T) -> I + 'static> DataSource<U>
    for FlatMappedSource<T, U, I, F>
{
    fn node(&self) -> Rc<dyn ExecNode> {
        self.inner.node()
    }

    fn register_child(&self, mut callback: Box<dyn FnMut(U) -> Result<()>>) {
        let f = self.f.clone();
        self.inner.register_child(Box::new(move |t: T| {
            for u in (f)(t) {
                callback(u)?;
            }
            Ok(())
        }));
    }
}
