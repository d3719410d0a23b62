use std::time::SystemTime;

use crate::error::{ViewerError, ViewerResult};

#[derive(Debug, Clone, PartialEq)]
pub struct ScanImage {
    /// Contiguous position in the set; selection and cache keys use this.
    pub index: usize,
    /// Index the image store knows the image by. Requests to the store and
    /// the analysis service use this one.
    pub remote_index: usize,
    pub reference: String,
    pub uploaded_at: SystemTime,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitionDirection {
    Forward,
    Backward,
}

impl TransitionDirection {
    pub fn between(previous: Option<usize>, current: usize) -> Option<Self> {
        match previous {
            Some(previous) if current > previous => Some(Self::Forward),
            Some(previous) if current < previous => Some(Self::Backward),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectionChange {
    Unchanged,
    Moved {
        previous: Option<usize>,
        current: usize,
    },
}

/// Ordered images of one scan. Indices are always `0..len`.
#[derive(Debug, Clone, Default)]
pub struct ImageSet {
    images: Vec<ScanImage>,
    selected: Option<usize>,
}

impl ImageSet {
    /// Builds a set from `(remote index, reference)` pairs. Gaps in the remote
    /// numbering are closed up locally; each image keeps its remote index.
    pub fn from_listing(mut listing: Vec<(usize, String)>) -> Self {
        listing.sort_by_key(|(index, _)| *index);
        let now = SystemTime::now();
        let images = listing
            .into_iter()
            .enumerate()
            .map(|(index, (remote_index, reference))| ScanImage {
                index,
                remote_index,
                reference,
                uploaded_at: now,
            })
            .collect::<Vec<_>>();
        let selected = if images.is_empty() { None } else { Some(0) };
        Self { images, selected }
    }

    pub fn len(&self) -> usize {
        self.images.len()
    }

    pub fn is_empty(&self) -> bool {
        self.images.is_empty()
    }

    pub fn images(&self) -> &[ScanImage] {
        &self.images
    }

    pub fn get(&self, index: usize) -> Option<&ScanImage> {
        self.images.get(index)
    }

    pub fn selected_index(&self) -> Option<usize> {
        self.selected
    }

    pub fn selected(&self) -> Option<&ScanImage> {
        self.selected.and_then(|index| self.images.get(index))
    }

    /// Records an image the remote store already accepted under `remote_index`.
    pub fn add_image(
        &mut self,
        reference: impl Into<String>,
        remote_index: usize,
    ) -> ViewerResult<usize> {
        let reference = reference.into();
        if reference.trim().is_empty() {
            return Err(ViewerError::UploadRejected(
                "image store returned an empty reference".to_string(),
            ));
        }
        let index = self.images.len();
        self.images.push(ScanImage {
            index,
            remote_index,
            reference,
            uploaded_at: SystemTime::now(),
        });
        if self.selected.is_none() {
            self.selected = Some(index);
        }
        Ok(index)
    }

    /// Removes the image at `index` and closes the gap. Callers holding
    /// index-keyed state must shift it in the same step.
    pub fn delete_image(&mut self, index: usize) -> ViewerResult<ScanImage> {
        self.check_bounds(index)?;
        if self.images.len() == 1 {
            return Err(ViewerError::LastImageError);
        }

        let removed = self.images.remove(index);
        for image in self.images.iter_mut().skip(index) {
            image.index -= 1;
        }

        let last = self.images.len() - 1;
        self.selected = self.selected.map(|selected| {
            if selected > index {
                selected - 1
            } else {
                selected.min(last)
            }
        });
        Ok(removed)
    }

    pub fn select(&mut self, index: usize) -> ViewerResult<SelectionChange> {
        self.check_bounds(index)?;
        if self.selected == Some(index) {
            return Ok(SelectionChange::Unchanged);
        }
        let previous = self.selected.replace(index);
        Ok(SelectionChange::Moved {
            previous,
            current: index,
        })
    }

    pub fn next(&mut self) -> ViewerResult<SelectionChange> {
        match self.selected {
            Some(current) if current + 1 < self.images.len() => self.select(current + 1),
            Some(_) => Ok(SelectionChange::Unchanged),
            None => self.first(),
        }
    }

    pub fn previous(&mut self) -> ViewerResult<SelectionChange> {
        match self.selected {
            Some(current) if current > 0 => self.select(current - 1),
            Some(_) => Ok(SelectionChange::Unchanged),
            None => self.first(),
        }
    }

    pub fn first(&mut self) -> ViewerResult<SelectionChange> {
        self.select(0)
    }

    pub fn last(&mut self) -> ViewerResult<SelectionChange> {
        self.select(self.images.len().saturating_sub(1))
    }

    fn check_bounds(&self, index: usize) -> ViewerResult<()> {
        if index < self.images.len() {
            Ok(())
        } else {
            Err(ViewerError::IndexOutOfRange {
                index,
                len: self.images.len(),
            })
        }
    }
}
