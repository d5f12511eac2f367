//! Lock-Free Reclamation List (Treiber stack, drain-all consumer)
//!
//! Banyak producer (worker threads yang memanggil `close`) melakukan push
//! dengan CAS retry loop. Satu consumer (network thread) mengambil seluruh
//! list sekaligus dengan satu `swap(null)`.
//!
//! Tidak ada pop satu-per-satu, jadi tidak ada ABA: sebuah node hanya bisa
//! keluar dari head lewat swap, dan setelah itu hanya consumer yang
//! memegangnya.

use std::iter::FusedIterator;
use std::marker::PhantomData;
use std::ptr;
use std::sync::atomic::{AtomicPtr, Ordering};

struct Node<T> {
    value: T,
    next: *mut Node<T>,
}

/// Multi-producer, single-consumer list of values waiting to be reclaimed
pub struct ReclaimList<T> {
    head: AtomicPtr<Node<T>>,
}

// SAFETY: nodes dipindahkan antar thread sebagai Box yang utuh. Producer
// hanya menulis node miliknya sebelum publish (Release), consumer membaca
// setelah swap (Acquire). Tidak ada shared &T antar thread.
unsafe impl<T: Send> Send for ReclaimList<T> {}
unsafe impl<T: Send> Sync for ReclaimList<T> {}

impl<T> Default for ReclaimList<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> ReclaimList<T> {
    pub const fn new() -> Self {
        Self {
            head: AtomicPtr::new(ptr::null_mut()),
        }
    }

    /// Push satu value (producer side). Lock-free, retry until success.
    pub fn push(&self, value: T) {
        let node = Box::into_raw(Box::new(Node {
            value,
            next: ptr::null_mut(),
        }));

        let mut head = self.head.load(Ordering::Relaxed);
        loop {
            // SAFETY: node belum dipublish, masih eksklusif milik kita
            unsafe { (*node).next = head };

            match self
                .head
                .compare_exchange_weak(head, node, Ordering::Release, Ordering::Relaxed)
            {
                Ok(_) => return,
                Err(current) => head = current,
            }
        }
    }

    /// Ambil seluruh list dan reset ke kosong (consumer side).
    ///
    /// Push yang berjalan bersamaan akan berhasil di list lama (ikut terambil)
    /// atau di list baru (terambil pada drain berikutnya), tidak pernah hilang.
    pub fn take_all(&self) -> ReclaimBatch<T> {
        let head = self.head.swap(ptr::null_mut(), Ordering::Acquire);
        ReclaimBatch::from_raw(head)
    }

    /// Sambungkan kembali batch yang sudah di-drain ke depan list.
    ///
    /// Dipakai saat batch tidak bisa diproses cycle ini; apa pun yang
    /// di-push sejak drain tetap ada di belakang batch.
    pub fn reattach(&self, batch: ReclaimBatch<T>) {
        if batch.is_empty() {
            return;
        }
        let tail = batch.tail();
        let first = batch.into_raw();

        let mut head = self.head.load(Ordering::Relaxed);
        loop {
            // SAFETY: tail milik batch yang sudah kita lepas tapi belum dipublish
            unsafe { (*tail).next = head };

            match self
                .head
                .compare_exchange_weak(head, first, Ordering::Release, Ordering::Relaxed)
            {
                Ok(_) => return,
                Err(current) => head = current,
            }
        }
    }

    /// Snapshot check, bisa langsung basi kalau ada producer aktif
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.head.load(Ordering::Acquire).is_null()
    }
}

impl<T> Drop for ReclaimList<T> {
    fn drop(&mut self) {
        drop(self.take_all());
    }
}

/// Private list produced by [`ReclaimList::take_all`].
///
/// Owned by the consumer alone. Dropping the batch drops every value in it.
pub struct ReclaimBatch<T> {
    head: *mut Node<T>,
    len: usize,
    _owns: PhantomData<Box<Node<T>>>,
}

// SAFETY: batch memiliki semua node secara eksklusif
unsafe impl<T: Send> Send for ReclaimBatch<T> {}
unsafe impl<T: Sync> Sync for ReclaimBatch<T> {}

impl<T> ReclaimBatch<T> {
    fn from_raw(head: *mut Node<T>) -> Self {
        let mut len = 0;
        let mut cur = head;
        while !cur.is_null() {
            len += 1;
            // SAFETY: node berasal dari Box::into_raw dan belum di-free
            cur = unsafe { (*cur).next };
        }
        Self {
            head,
            len,
            _owns: PhantomData,
        }
    }

    pub fn empty() -> Self {
        Self::from_raw(ptr::null_mut())
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.head.is_null()
    }

    /// Most recently pushed first.
    pub fn iter(&self) -> Iter<'_, T> {
        Iter {
            cur: self.head,
            _batch: PhantomData,
        }
    }

    fn tail(&self) -> *mut Node<T> {
        let mut cur = self.head;
        // SAFETY: dipanggil hanya untuk batch non-kosong milik kita
        unsafe {
            while !(*cur).next.is_null() {
                cur = (*cur).next;
            }
        }
        cur
    }

    fn into_raw(self) -> *mut Node<T> {
        let head = self.head;
        std::mem::forget(self);
        head
    }
}

impl<T> Drop for ReclaimBatch<T> {
    fn drop(&mut self) {
        let mut cur = self.head;
        while !cur.is_null() {
            // SAFETY: setiap node di-free tepat sekali, di sini
            let node = unsafe { Box::from_raw(cur) };
            cur = node.next;
        }
    }
}

pub struct Iter<'a, T> {
    cur: *const Node<T>,
    _batch: PhantomData<&'a ReclaimBatch<T>>,
}

impl<'a, T> Iterator for Iter<'a, T> {
    type Item = &'a T;

    fn next(&mut self) -> Option<&'a T> {
        if self.cur.is_null() {
            return None;
        }
        // SAFETY: batch hidup selama 'a dan tidak dimutasi selama iterasi
        let node = unsafe { &*self.cur };
        self.cur = node.next;
        Some(&node.value)
    }
}

impl<T> FusedIterator for Iter<'_, T> {}

impl<'a, T> IntoIterator for &'a ReclaimBatch<T> {
    type Item = &'a T;
    type IntoIter = Iter<'a, T>;

    fn into_iter(self) -> Iter<'a, T> {
        self.iter()
    }
}
