use std::any::Any;

use crate::Result;

/// A workspace that contains type-erased objects.
///
/// Backends use a workspace to attach their own data to library objects: device mirrors of
/// tables, compiled kernels, scratch buffers. Each backend stores its data under its own type,
/// so several backends may share the same object without clashing.
#[derive(Debug, Default)]
pub struct Workspace {
    workspaces: Vec<Box<dyn Any + Send>>,
}

impl Workspace {
    pub fn get_or_insert_with<W, F>(&mut self, create: F) -> &mut W
    where
        W: 'static + Send,
        F: FnOnce() -> W,
    {
        let idx = match self.workspaces.iter().rposition(|ws| ws.is::<W>()) {
            Some(idx) => idx,
            None => {
                self.workspaces.push(Box::new(create()));
                self.workspaces.len() - 1
            }
        };
        self.promote_and_get(idx)
    }

    /// Like [`get_or_insert_with`](Self::get_or_insert_with), for objects whose creation may fail.
    ///
    /// Nothing is stored if `create` returns an error.
    pub fn try_get_or_insert_with<W, F>(&mut self, create: F) -> Result<&mut W>
    where
        W: 'static + Send,
        F: FnOnce() -> Result<W>,
    {
        let idx = self.index_of_or_push::<W>(create)?;
        Ok(self.promote_and_get(idx))
    }

    pub fn get_or_default<W>(&mut self) -> &mut W
    where
        W: 'static + Send + Default,
    {
        self.get_or_insert_with(Default::default)
    }

    pub fn get_mut<W: 'static>(&mut self) -> Option<&mut W> {
        self.workspaces
            .iter_mut()
            .rev()
            .find_map(|ws| ws.downcast_mut::<W>())
    }

    /// Drops the stored object of type `W`, if any.
    pub fn remove<W: 'static>(&mut self) -> Option<Box<W>> {
        let idx = self.workspaces.iter().rposition(|ws| ws.is::<W>())?;
        self.workspaces.swap_remove(idx).downcast().ok()
    }

    fn index_of_or_push<W>(&mut self, create: impl FnOnce() -> Result<W>) -> Result<usize>
    where
        W: 'static + Send,
    {
        match self.workspaces.iter().rposition(|ws| ws.is::<W>()) {
            Some(idx) => Ok(idx),
            None => {
                let w = create()?;
                self.workspaces.push(Box::new(w));
                Ok(self.workspaces.len() - 1)
            }
        }
    }

    fn promote_and_get<W: 'static>(&mut self, idx: usize) -> &mut W {
        // Most recently used entry goes last, where `rposition` finds it first
        let last = self.workspaces.len() - 1;
        self.workspaces.swap(idx, last);

        let entry = &mut self.workspaces[last];
        entry
            .downcast_mut()
            .expect("Internal error: Downcasting can by definition not fail")
    }
}
